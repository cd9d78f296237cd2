pub mod api;
pub mod auth;
pub mod channel;
pub mod connection;
pub mod constants;
pub mod controls;
pub mod invite;
pub mod media;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod synchronizer;
pub mod utils;

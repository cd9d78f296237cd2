use url::Url;
use urlencoding::{decode, encode};

const INVITE_PREFIX: &str = "watchparty://join?";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteLink {
    pub room_id: String,
    pub passcode: Option<String>,
}

pub fn build_invite_url(room_id: &str, passcode: Option<&str>) -> String {
    let mut params = vec![format!("room={}", encode(room_id))];
    if let Some(code) = passcode.filter(|c| !c.is_empty()) {
        params.push(format!("code={}", encode(code)));
    }
    format!("{INVITE_PREFIX}{}", params.join("&"))
}

/// Accepts `watchparty://` links, web links carrying the same query, or a bare query string.
pub fn parse_invite_url(input: &str) -> Option<InviteLink> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let normalized = if trimmed.starts_with("watchparty://")
        || trimmed.starts_with("http://")
        || trimmed.starts_with("https://")
    {
        trimmed.to_string()
    } else {
        format!("{INVITE_PREFIX}{trimmed}")
    };

    let url = Url::parse(&normalized).ok()?;
    let mut room_id = None;
    let mut passcode = None;

    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "room" => room_id = decode(&value).ok().map(|v| v.into_owned()),
            "code" => passcode = decode(&value).ok().map(|v| v.into_owned()),
            _ => {}
        }
    }

    Some(InviteLink {
        room_id: room_id.filter(|id| !id.is_empty())?,
        passcode: passcode.filter(|code| !code.is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invite_links() {
        let url = build_invite_url("123-456", Some("movie night"));
        assert_eq!(url, "watchparty://join?room=123-456&code=movie%20night");
        assert_eq!(
            parse_invite_url(&url),
            Some(InviteLink {
                room_id: "123-456".into(),
                passcode: Some("movie night".into()),
            })
        );
    }

    #[test]
    fn test_invite_variants() {
        assert_eq!(
            parse_invite_url("https://party.example/join?room=987-654").map(|l| l.room_id),
            Some("987-654".to_string())
        );
        assert_eq!(
            parse_invite_url("room=111-222&code=").unwrap().passcode,
            None
        );
        assert_eq!(parse_invite_url("watchparty://join?code=abc"), None);
        assert_eq!(parse_invite_url("   "), None);
    }
}

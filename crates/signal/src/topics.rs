use once_cell::sync::Lazy;
use regex::Regex;

static SIGNAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^call/([^/]+)/signal$").unwrap());

pub fn get_signal_topic(room: &str) -> String {
    format!("call/{}/signal", room)
}

pub fn split_signal_topic(topic: &str) -> Option<String> {
    SIGNAL_RE.captures(topic).and_then(|caps| caps.get(1).map(|m| m.as_str().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_signal_topic() {
        assert_eq!(get_signal_topic("lobby"), "call/lobby/signal");
        assert_eq!(get_signal_topic("42"), "call/42/signal");
    }

    #[test]
    fn test_split_signal_topic() {
        assert_eq!(split_signal_topic("call/lobby/signal"), Some("lobby".to_string()));
        assert_eq!(split_signal_topic("call/a/b/signal"), None);
        assert_eq!(split_signal_topic("caller/abc/status"), None);
        assert_eq!(split_signal_topic("call//signal"), None);
    }
}

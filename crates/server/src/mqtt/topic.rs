/// A filter is valid when `#` only appears alone as the last level and `+`
/// only appears alone in a level
pub fn valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    levels.iter().enumerate().all(|(i, level)| {
        let multi_ok = !level.contains('#') || (*level == "#" && i == levels.len() - 1);
        let single_ok = !level.contains('+') || *level == "+";
        multi_ok && single_ok
    })
}

/// Topic names a client may never see through wildcards at the first level
fn is_system_topic(topic: &str) -> bool {
    topic.starts_with('$')
}

pub fn matches(filter: &str, topic: &str) -> bool {
    if is_system_topic(topic) && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_validation() {
        assert!(valid_filter("live/binary/vehicle-etas"));
        assert!(valid_filter("live/+/vehicle-etas"));
        assert!(valid_filter("#"));
        assert!(valid_filter("live/#"));

        assert!(!valid_filter(""));
        assert!(!valid_filter("live/#/etas"));
        assert!(!valid_filter("live/bin#"));
        assert!(!valid_filter("live/b+"));
    }

    #[test]
    fn test_wildcard_matching() {
        assert!(matches("live/binary/vehicle-etas", "live/binary/vehicle-etas"));
        assert!(matches("live/+/vehicle-etas", "live/json/vehicle-etas"));
        assert!(matches("live/#", "live/json/vehicle-positions"));
        assert!(matches("live/#", "live"));
        assert!(matches("#", "dev/binary/vehicle-etas"));

        assert!(!matches("live/+", "live/json/vehicle-etas"));
        assert!(!matches("live/json/vehicle-etas", "live/json"));
        assert!(!matches("dev/#", "live/json/vehicle-etas"));
        assert!(!matches("#", "$SYS/uptime"));
    }
}

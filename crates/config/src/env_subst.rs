/// Expand `${NAME}` and `${NAME:-fallback}` placeholders in raw config text.
///
/// Unset variables without a fallback are kept verbatim so the parse error
/// (if any) points at the placeholder. An unterminated `${` is copied through.
pub fn substitute_env(input: &str) -> String {
    substitute_with(input, |name| std::env::var(name).ok())
}

fn substitute_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };

        let body = &after[..end];
        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };

        match (lookup(name), fallback) {
            (Some(value), _) if !name.is_empty() => out.push_str(&value),
            (None, Some(fallback)) if !name.is_empty() => out.push_str(fallback),
            _ => {
                out.push_str("${");
                out.push_str(body);
                out.push('}');
            },
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake(name: &str) -> Option<String> {
        (name == "WAGATE_BRIDGE").then(|| "node".to_string())
    }

    #[test]
    fn expands_known_variable() {
        assert_eq!(
            substitute_with("command = \"${WAGATE_BRIDGE}\"", fake),
            "command = \"node\""
        );
    }

    #[test]
    fn fallback_used_when_unset() {
        assert_eq!(
            substitute_with("dir = \"${WAGATE_DIR:-/var/lib/wagate}\"", fake),
            "dir = \"/var/lib/wagate\""
        );
    }

    #[test]
    fn unknown_variable_kept() {
        assert_eq!(substitute_with("${WAGATE_MISSING}", fake), "${WAGATE_MISSING}");
    }

    #[test]
    fn unterminated_placeholder_copied() {
        assert_eq!(substitute_with("a ${WAGATE_BRIDGE", fake), "a ${WAGATE_BRIDGE");
    }
}

// Adapted from: https://github.com/kubernetes/client-go/blob/ca4a13f6dec7cb79cfd85df0ab3d7cfd05c5c5e9/rest/request.go#L526C1-L605C2
pub fn template_path(path: &str, base_path: Option<&str>) -> String {
    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut trimmed_base_path = String::new();

    if let Some(base) = base_path {
        if !base.is_empty() && path.starts_with(base) {
            let p = path.trim_start_matches(base);
            trimmed_base_path = base.to_string();
            segments = p.split('/').filter(|s| !s.is_empty()).collect();
        }
    };

    if segments.len() <= 2 {
        // Return as is if not enough segments
        return path.to_owned();
    };

    const CORE_GROUP_PREFIX: &str = "api";
    const NAMED_GROUP_PREFIX: &str = "apis";
    let index = match segments[0] {
        CORE_GROUP_PREFIX => 2,
        NAMED_GROUP_PREFIX => 3,
        _ => return "/{prefix}".to_owned(),
    };

    match segments.len() - index {
        // resource (with no name) do nothing
        1 => {}
        2 => {
            // /$RESOURCE/$NAME: replace $NAME with {name}
            segments[index + 1] = "{name}";
        }
        3 => {
            if segments[index + 2] == "finalize" || segments[index + 2] == "status" {
                // /$RESOURCE/$NAME/$SUBRESOURCE: replace $NAME with {name}
                segments[index + 1] = "{name}";
            } else {
                // /namespace/$NAMESPACE/$RESOURCE: replace $NAMESPACE with {namespace}
                segments[index + 1] = "{namespace}";
            }
        }
        _ => {
            segments[index + 1] = "{namespace}";
            // /namespace/$NAMESPACE/$RESOURCE/$NAME: replace $NAMESPACE with {namespace},  $NAME with {name}
            if segments[index + 3] != "finalize" && segments[index + 3] != "status" {
                // /$RESOURCE/$NAME/$SUBRESOURCE: replace $NAME with {name}
                segments[index + 3] = "{name}";
            }
        }
    }

    format!(
        "{}/{}",
        trimmed_base_path.trim_end_matches('/'),
        segments.join("/")
    )
}

use std::sync::LazyLock;

/// Defines the application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{}-{}{}",
        env!("IMAGE_VERSION"),
        option_env!("VERGEN_GIT_SHA").unwrap_or("unknown"),
        if git_dirty() { "-dirty" } else { "" }
    )
});

/// Branch the binary was built from, if known.
pub fn branch() -> &'static str {
    option_env!("VERGEN_GIT_BRANCH").unwrap_or("unknown")
}

fn git_dirty() -> bool {
    option_env!("VERGEN_GIT_DIRTY") == Some("true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_starts_with_image_version() {
        assert!(VERSION.starts_with(env!("IMAGE_VERSION")));
        assert!(!branch().is_empty());
    }

    #[test]
    fn dirty_suffix_follows_build_state() {
        assert_eq!(VERSION.ends_with("-dirty"), git_dirty());
    }
}

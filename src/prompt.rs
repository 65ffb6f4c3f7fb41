//! Vision chat prompt construction

/// Placeholder marking where the image goes inside a user message
pub const IMAGE_PLACEHOLDER: &str = "<image>";

/// System and user halves of a vision prompt, evaluated around the image
/// embedding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisionPrompt {
    pub system: String,
    pub user: String,
}

impl VisionPrompt {
    /// Split `message` around an `<image>` placeholder, or wrap it in the
    /// llava-1.5 template with `default_system` when there is none
    pub fn build(message: &str, default_system: &str) -> Self {
        match message.split_once(IMAGE_PLACEHOLDER) {
            Some((system, user)) => Self {
                system: system.to_string(),
                user: user.to_string(),
            },
            None => Self {
                system: default_system.to_string(),
                user: format!("{}\nASSISTANT:", message),
            },
        }
    }
}

/// Whether any non-empty marker occurs in `reply`
pub fn contains_stop_marker<S: AsRef<str>>(reply: &str, markers: &[S]) -> bool {
    markers
        .iter()
        .map(AsRef::as_ref)
        .any(|marker| !marker.is_empty() && reply.contains(marker))
}

pub mod annotate;
pub mod assemble;
pub mod engine;
pub mod generate;
pub mod llm;
pub mod recovery;
pub mod script;
pub mod store;
pub mod voice;

/// Lazily compiled regex from a literal pattern.
macro_rules! re {
    ($pattern:literal) => {{
        static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
        RE.get_or_init(|| regex::Regex::new($pattern).unwrap())
    }};
}
pub(crate) use re;

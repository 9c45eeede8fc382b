pub mod keys;
pub mod template;

pub use keys::{load_or_generate, SshKeyPair};
pub use template::render;

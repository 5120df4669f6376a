pub mod fallback;

pub use fallback::{Candidate, FallbackProvider};

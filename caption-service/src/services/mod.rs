pub mod captioner;
pub mod image;
pub mod metrics;

pub use captioner::{build_captioner, CaptionError, Captioner};
pub use self::metrics::{get_metrics, init_metrics};

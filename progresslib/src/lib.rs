mod progress;

pub use progress::{ProgressBar, ProgressDrawMode, ProgressSpeed};

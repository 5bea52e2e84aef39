//! Page cache and prefetch core for a paginated image reader.
//!
//! A document is a single image, a folder of images, or a ZIP/CBZ archive
//! read through an external `unzip`. [`state::ReaderState`] drives a session:
//! it keeps the pages around the cursor decoded in a bounded cache and warms
//! the neighbours in the background.

pub mod config;
pub mod error;
pub mod image;
pub mod state;

pub use config::Settings;
pub use error::{PagerError, Result};
pub use image::{ContentSource, PageReference};
pub use state::{ReaderPhase, ReaderServices, ReaderState, ReadingDirection};

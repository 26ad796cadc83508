//! Domain model (tasks, quotes, ranked rows, errors, progress).
//!
//! I/O を持たない層。ブラウザ・ストレージには依存しない。

pub mod brand;
pub mod errors;
pub mod image;
pub mod progress;
pub mod quote;
pub mod ranked;
pub mod ranking;
pub mod task;

pub use self::brand::{SUPPORTED_BRANDS, product_url, resolve_brand_code};
pub use self::errors::{ErrorKind, RunError, ScrapeError};
pub use self::image::image_destination;
pub use self::progress::{ProgressFn, ProgressTracker, RunProgress, silent_progress};
pub use self::quote::{CompetitorQuote, ListingFilter, QuotePrice, extract_quotes, find_image_url};
pub use self::ranked::{Field, NO_LISTING, RankedRow, WE_ARE_LAST, WE_LEAD};
pub use self::ranking::rank;
pub use self::task::{InputRow, Task, TaskKey};

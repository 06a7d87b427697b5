//! Duo State - Merged controlled/uncontrolled state
//!
//! This crate implements the state merger:
//! - Mode latch (never controlled vs. controlled)
//! - Output resolution from external, internal and mode
//! - Deferred synchronization of the internal cell
//!
//! ```
//! use duo_core::{Cell, Runtime};
//! use duo_state::merge;
//!
//! let rt = Runtime::new();
//! let external = Cell::new(None);
//! let internal = Cell::new(1);
//! let merged = merge(&rt, &external, &internal);
//! assert_eq!(merged.get(), Some(1));
//!
//! external.set(Some(2));
//! assert_eq!(merged.get(), Some(2));
//! rt.flush().unwrap();
//! assert_eq!(internal.get(), 2);
//!
//! external.set(None);
//! assert_eq!(merged.get(), None);
//! ```

pub mod mode;
pub mod merge;

pub use mode::*;
pub use merge::*;

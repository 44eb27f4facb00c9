//! Test utilities for quay unit tests.
//!
//! Plugins are tested against real child processes: [`PluginFixture`] writes
//! a plugin directory whose handlers are POSIX shell snippets. Core steps and
//! the pipeline are tested with [`RecordingCoreStep`] and [`RecordingSink`].
//!
//! # Example
//!
//! ```rust,ignore
//! use quay::test_support::PluginFixture;
//!
//! #[test]
//! fn test_example() {
//!     let tmp = tempfile::TempDir::new().unwrap();
//!     let plugin = PluginFixture::new("hello")
//!         .handler("onPreBuild", "echo hi")
//!         .install(tmp.path());
//!     // Run `plugin` through a HandlerRunner...
//! }
//! ```

pub mod fixtures;

pub use fixtures::*;

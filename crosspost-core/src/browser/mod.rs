mod capture;
mod error;
mod launcher;
mod page;
mod profile;
mod retry;

pub use capture::{capture_page, DiagnosticRef};
pub use error::{BrowserError, BrowserResult};
pub use launcher::{BrowserLauncher, ChromiumLauncher, LaunchRequest};
pub use page::{BrowserPage, ChromiumPage, TEXT_SELECTOR_PREFIX};
pub use profile::{BrowserProfile, ProfileManager};
pub use retry::{RetryOutcome, RetryPolicy};

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared CLI utilities for the SOS toolchain.
//!
//! [`IndicatifProgress`] renders harvest and processing progress behind the
//! [`ProgressCallback`] trait. [`init_logger`] routes `log` output through
//! `indicatif-log-bridge` so log lines and bars do not overwrite each other.

use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;
use sos_harvest::progress::ProgressCallback;

pub use indicatif::MultiProgress;

const SPINNER_TEMPLATE: &str = "{spinner:.cyan} {msg}: {human_pos} records [{elapsed}]";
const BAR_TEMPLATE: &str = "  {msg} {wide_bar:.cyan/dim} {human_pos}/{human_len} {percent}% [{eta}]";

/// Per-provider record counter backed by an `indicatif` [`ProgressBar`].
///
/// Cursor harvests never learn their total, so the counter starts as a
/// spinner and only turns into a bar once [`ProgressCallback::set_total`]
/// is called (range harvests and processing runs).
pub struct IndicatifProgress {
    bar: ProgressBar,
    with_total: ProgressStyle,
}

impl IndicatifProgress {
    /// Adds a counter for `identifier` to `multi`.
    #[must_use]
    pub fn provider_bar(multi: &MultiProgress, identifier: &str) -> Arc<dyn ProgressCallback> {
        let bar = multi.add(ProgressBar::new_spinner());
        bar.enable_steady_tick(Duration::from_millis(120));
        bar.set_style(
            ProgressStyle::with_template(SPINNER_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(identifier.to_string());

        let with_total = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");

        Arc::new(Self { bar, with_total })
    }
}

impl ProgressCallback for IndicatifProgress {
    fn set_total(&self, total: u64) {
        self.bar.set_style(self.with_total.clone());
        self.bar.set_length(total);
        self.bar.reset();
    }

    fn inc(&self, delta: u64) {
        self.bar.inc(delta);
    }

    fn set_message(&self, msg: String) {
        self.bar.set_message(msg);
    }

    fn finish(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }
}

/// Installs `pretty_env_logger` behind `indicatif-log-bridge` and returns
/// the [`MultiProgress`] every bar must be added to.
///
/// Logs at `info` unless `RUST_LOG` says otherwise.
#[must_use]
pub fn init_logger() -> MultiProgress {
    let multi = MultiProgress::new();

    let logger = pretty_env_logger::formatted_builder()
        .filter_level(LevelFilter::Info)
        .parse_env("RUST_LOG")
        .build();
    let level = logger.filter();

    if indicatif_log_bridge::LogWrapper::new(multi.clone(), logger)
        .try_init()
        .is_ok()
    {
        log::set_max_level(level);
    }

    multi
}

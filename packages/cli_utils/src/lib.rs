#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Terminal plumbing for the `pos_sync` binary: a progress bar for sync runs
//! and a logger that prints above it.

use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;
use pos_sync::ProgressCallback;

pub use indicatif::MultiProgress;

const SPINNER_TEMPLATE: &str = "{spinner:.green} {prefix:.bold} {msg}";
const WINDOWS_TEMPLATE: &str =
    "{prefix:.bold} [{bar:32.green/white}] {pos}/{len} windows ({elapsed}) {msg}";

/// Renders a sync run on a [`ProgressBar`].
///
/// The bar starts as a spinner while branches are resolved and switches to
/// a counted bar once the run reports how many code windows it will visit.
pub struct IndicatifProgress {
    bar: ProgressBar,
    counted: ProgressStyle,
}

impl IndicatifProgress {
    /// Adds a window bar labelled `label` (e.g. `"Payments 2025-01-01_2025-01-31"`)
    /// to `multi`.
    #[must_use]
    pub fn windows_bar(multi: &MultiProgress, label: &str) -> Arc<dyn ProgressCallback> {
        let spinner = ProgressStyle::with_template(SPINNER_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        let counted = ProgressStyle::with_template(WINDOWS_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");

        let bar = multi.add(ProgressBar::new_spinner().with_style(spinner));
        bar.set_prefix(label.to_owned());
        bar.set_message("resolving branches");
        bar.enable_steady_tick(Duration::from_millis(120));

        Arc::new(Self { bar, counted })
    }
}

impl ProgressCallback for IndicatifProgress {
    fn set_total(&self, total: u64) {
        self.bar.set_style(self.counted.clone());
        self.bar.set_length(total);
        self.bar.reset();
    }

    fn set_message(&self, msg: String) {
        self.bar.set_message(msg);
    }

    fn inc(&self, delta: u64) {
        self.bar.inc(delta);
    }

    fn finish(&self, msg: String) {
        self.bar.disable_steady_tick();
        self.bar.finish_with_message(msg);
    }
}

/// Installs `pretty_env_logger` behind `indicatif-log-bridge` so log lines
/// are printed above any active bar.
///
/// `RUST_LOG` is honored when set. Otherwise `info` is used, since a sync run
/// reports its per-window decisions at that level.
///
/// Every bar must be added to the returned [`MultiProgress`].
#[must_use]
pub fn init_logger() -> MultiProgress {
    let mut builder = pretty_env_logger::formatted_builder();
    match std::env::var("RUST_LOG") {
        Ok(filters) if !filters.trim().is_empty() => {
            builder.parse_filters(&filters);
        }
        _ => {
            builder.filter_level(LevelFilter::Info);
        }
    }
    let logger = builder.build();
    let max_level = logger.filter();

    let multi = MultiProgress::new();
    if indicatif_log_bridge::LogWrapper::new(multi.clone(), logger)
        .try_init()
        .is_ok()
    {
        log::set_max_level(max_level);
    }

    multi
}

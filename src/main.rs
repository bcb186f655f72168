#![warn(future_incompatible)]
#![warn(let_underscore)]
#![warn(clippy::cargo)]
#![warn(clippy::nursery)]
#![warn(clippy::pedantic)]
#![warn(clippy::restriction)]
#![allow(clippy::arithmetic_side_effects)]
#![allow(clippy::blanket_clippy_restriction_lints)]
#![allow(clippy::exhaustive_enums)]
#![allow(clippy::exhaustive_structs)]
#![allow(clippy::float_arithmetic)]
#![allow(clippy::implicit_return)]
#![allow(clippy::missing_docs_in_private_items)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_inline_in_public_items)]
#![allow(clippy::pattern_type_mismatch)]
#![allow(clippy::separated_literal_suffix)]
#![allow(clippy::shadow_reuse)]
#![allow(clippy::std_instead_of_core)]

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::error;

use gif_target_size::cancel::CancelFlag;
use gif_target_size::config;
use gif_target_size::util::{self, HumanSize};
use gif_target_size::SearchOutcome;

#[allow(clippy::print_stderr)]
#[allow(clippy::print_stdout)]
fn main() -> anyhow::Result<ExitCode> {
    util::install_tracing().context("Unable to install tracing subsystem")?;

    let config = config::Config::parse();

    let cancel = CancelFlag::new();
    let handler_cancel = cancel.clone();

    ctrlc::set_handler(move || {
        if !handler_cancel.is_cancelled() {
            error!("Cancelling. Waiting for running encoders to stop...");
        }

        handler_cancel.cancel();
    })
    .context("Unable to install Ctrl-C handler")?;

    let outcome = gif_target_size::run(&config, &cancel).context("Unable to run application")?;

    match &outcome {
        SearchOutcome::Found(output) => {
            println!("{} ({})", output.path.display(), HumanSize(output.size));
        }
        SearchOutcome::NotFound => {
            eprintln!("Unable to produce a GIF within the requested size");
        }
        SearchOutcome::Cancelled => {}
    }

    Ok(ExitCode::from(outcome.exit_code()))
}

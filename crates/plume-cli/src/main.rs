// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

//! `plume-vm`: loads a program image and runs it (spec §10).

use std::fs::File;
use std::process::ExitCode;

use clap::Parser;

use plume_image::ImageReader;
use plume_loader::DynamicLoader;
use plume_runtime::Module;

/// Runs a Plume bytecode image.
#[derive(Parser, Debug)]
#[command(name = "plume-vm", version, about)]
struct Args {
    /// Path to a compiled Plume program image.
    image_path: String,
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("PLUME_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run() -> Result<(), String> {
    let args = Args::parse();

    let file = File::open(&args.image_path)
        .map_err(|err| format!("could not open image '{}': {err}", args.image_path))?;
    let program = ImageReader::read_from(file)
        .map_err(|err| format!("could not decode image '{}': {err}", args.image_path))?;

    tracing::debug!(
        instructions = program.instruction_count(),
        constants = program.constants.len(),
        libraries = program.libraries.libraries.len(),
        "program image decoded"
    );

    let plume_path = std::env::var("PLUME_PATH").ok();
    let argv: Vec<String> = std::env::args().collect();

    let mut module = Module::new(
        &program,
        Box::new(DynamicLoader),
        plume_path.as_deref(),
        &argv,
    )
    .map_err(|err| format!("{err}"))?;

    plume_runtime::run(&mut module, &program.instructions).map_err(|err| format!("{err}"))?;

    Ok(())
}

fn main() -> ExitCode {
    init_logging();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("plume-vm: {message}");
            ExitCode::FAILURE
        }
    }
}

//! JSON output for CLI commands
//!
//! Results go to stdout as one pretty-printed object. Failures go to stderr
//! on a single line so they stay greppable next to log output.

use std::io::{self, Write};

use serde_json::{json, Value};

use super::errors::{CliError, CliResult};

fn emit(mut out: impl Write, value: &Value, pretty: bool) -> CliResult<()> {
    if pretty {
        serde_json::to_writer_pretty(&mut out, value)?;
    } else {
        serde_json::to_writer(&mut out, value)?;
    }
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

/// Prints a command result.
pub fn write_response(data: Value) -> CliResult<()> {
    emit(io::stdout().lock(), &json!({ "status": "ok", "data": data }), true)
}

/// Prints a command failure with its stable code.
pub fn write_error(err: &CliError) -> CliResult<()> {
    let failure = json!({
        "status": "error",
        "code": err.code_str(),
        "message": err.message(),
    });
    emit(io::stderr().lock(), &failure, false)
}

//! Request bodies and their interpretation.
//!
//! The `/wasm` endpoint takes loosely formatted, command-line style input:
//! the target function in `options` and whitespace-separated arguments in
//! `params`. This module turns that into a function name and a JSON
//! argument list.

use serde::Deserialize;
use serde_json::Value;

use modhost_core::module::ENTRY_POINT;

/// Body of `POST /run`.
#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    /// Passed to the guest as `NAME` in its environment.
    pub name: String,
    /// Module to run. Defaults to the active module.
    #[serde(default)]
    pub module: Option<String>,
}

/// Body of `POST /wasm`.
#[derive(Debug, Clone, Deserialize)]
pub struct WasmRequest {
    /// Module name, with or without the module file extension.
    pub wasm: String,
    /// `--func=<name>`, `-f <name>`, or a bare function name.
    #[serde(default)]
    pub options: Option<String>,
    /// Whitespace-separated arguments.
    #[serde(default)]
    pub params: Option<String>,
}

/// Body of `POST /modules/:name/functions/:function`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallRequest {
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Strip surrounding whitespace and a trailing module extension.
pub fn module_name_from(wasm: &str, extension: &str) -> String {
    let wasm = wasm.trim();
    wasm.strip_suffix(extension)
        .and_then(|stem| stem.strip_suffix('.'))
        .unwrap_or(wasm)
        .to_string()
}

/// Function named by `options`, or the entry point.
///
/// Options that start with a dash but are neither `--func=` nor `-f` are
/// ignored.
pub fn function_from_options(options: Option<&str>) -> String {
    let options = options.map(str::trim).unwrap_or_default();
    let mut words = options.split_whitespace();

    let named = if let Some(rest) = options.strip_prefix("--func=") {
        rest.split_whitespace().next()
    } else if options.starts_with("-f ") {
        words.by_ref().skip_while(|w| *w != "-f").nth(1)
    } else if !options.starts_with('-') {
        words.next()
    } else {
        None
    };

    named.unwrap_or(ENTRY_POINT).to_string()
}

/// Split `params` on whitespace. Integers become JSON integers, other
/// numbers become floats, anything else stays a string.
pub fn args_from_params(params: Option<&str>) -> Vec<Value> {
    params
        .unwrap_or_default()
        .split_whitespace()
        .map(|word| {
            if let Ok(int) = word.parse::<i64>() {
                Value::from(int)
            } else if let Some(float) = word
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
            {
                Value::Number(float)
            } else {
                Value::from(word)
            }
        })
        .collect()
}

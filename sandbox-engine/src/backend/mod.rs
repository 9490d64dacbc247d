//! Built-in [`Backend`](sandbox::Backend) implementations.

mod python;
mod shell;

pub use python::{PythonBackend, PythonTool};
pub use shell::ShellBackend;

/// Quote `s` for `/bin/sh`. Plain words are passed through.
pub fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./:=@+,%".contains(&b));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

fn quote_all(words: &[String]) -> String {
    words
        .iter()
        .map(|w| shell_quote(w))
        .collect::<Vec<_>>()
        .join(" ")
}

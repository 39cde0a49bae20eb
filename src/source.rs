//! Textual signatures for capability callables.
//!
//! A [`Function`](crate::capability::Function) may carry the source of its
//! body so the oracle can see exactly what it does. Named functions supply
//! their full text. Inline closures only know the line they were written on,
//! which may hold several expressions; [`signature_of`] grows a candidate
//! from the first closure boundary until it parses as a standalone closure
//! expression. This is best effort: with two closures on one line the result
//! is syntactically valid but not necessarily the one the author meant.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

/// Where the text of a callable comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallableSource {
    /// Full defining text of a named function.
    Named(String),
    /// A single source line holding an inline closure.
    Inline(String),
    /// File and 1-based line of an inline closure, read on demand.
    Location { file: String, line: u32 },
}

impl CallableSource {
    pub fn named(text: impl Into<String>) -> Self {
        Self::Named(text.into())
    }

    pub fn inline(line: impl Into<String>) -> Self {
        Self::Inline(line.into())
    }
}

/// Capture the current file and line as a [`CallableSource::Location`].
///
/// `FunctionBuilder::sync_fn` and `async_fn` record their own call site, so
/// this is for closures defined away from the builder:
///
/// ```ignore
/// let (double, source) = (|x: f64| x * 2.0, taskgen::inline_source!());
/// ```
#[macro_export]
macro_rules! inline_source {
    () => {
        $crate::source::CallableSource::Location {
            file: file!().to_string(),
            line: line!(),
        }
    };
}

/// Signature text for `source`, or `None` if it cannot be recovered.
pub fn signature_of(source: &CallableSource) -> Option<String> {
    match source {
        CallableSource::Named(text) => {
            let text = text.trim();
            (!text.is_empty()).then(|| text.to_string())
        }
        CallableSource::Inline(line) => closure_from_line(line),
        CallableSource::Location { file, line } => {
            let text = read_line(Path::new(file), *line)?;
            closure_from_line(&text)
        }
    }
}

fn closure_start() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:\bmove\s*)?\|[^|]*\|.*").expect("closure pattern is a valid regex")
    })
}

fn parses_as_closure(code: &str) -> bool {
    syn::parse_str::<syn::ExprClosure>(code.trim()).is_ok()
}

/// Grow a candidate closure from the first boundary on `line`.
fn closure_from_line(line: &str) -> Option<String> {
    let line = line.split("//").next().unwrap_or_default();
    let found = closure_start().find(line)?.as_str();

    let segments: Vec<&str> = found.split(',').filter(|s| !s.is_empty()).collect();
    let mut code = segments.first()?.to_string();

    // Widen across commas: argument lists and tuple bodies contain them.
    for segment in &segments[1..] {
        if parses_as_closure(&code) {
            break;
        }
        code.push(',');
        code.push_str(segment);
    }

    // Then shave trailing characters (`;`, `)`, following arguments).
    while !parses_as_closure(&code) {
        code.pop()?;
    }

    Some(code.trim().to_string())
}

fn read_line(file: &Path, line: u32) -> Option<String> {
    let index = usize::try_from(line).ok()?.checked_sub(1)?;
    candidate_paths(file).into_iter().find_map(|path| {
        let contents = std::fs::read_to_string(&path).ok()?;
        contents.lines().nth(index).map(str::to_string)
    })
}

/// `file!()` is relative to the directory cargo ran in, which is usually the
/// manifest directory but not always.
fn candidate_paths(file: &Path) -> Vec<PathBuf> {
    let mut paths = vec![file.to_path_buf()];
    if file.is_relative() {
        if let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") {
            paths.push(Path::new(&dir).join(file));
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn named_source_is_returned_verbatim() {
        let text = "fn dish_price(names: &[String]) -> Value {\n    todo()\n}\n";
        assert_eq!(
            signature_of(&CallableSource::named(text)).unwrap(),
            text.trim()
        );
        assert!(signature_of(&CallableSource::named("   ")).is_none());
    }

    #[test]
    fn single_closure_drops_statement_terminator() {
        let line = "    let double = |x: i32| x * 2;";
        assert_eq!(
            signature_of(&CallableSource::inline(line)).unwrap(),
            "|x: i32| x * 2"
        );
    }

    #[test]
    fn multi_argument_closure_is_widened_across_commas() {
        let line = "let add = |a: i32, b: i32| a + b; // sum";
        assert_eq!(
            signature_of(&CallableSource::inline(line)).unwrap(),
            "|a: i32, b: i32| a + b"
        );
    }

    #[test]
    fn two_closures_on_one_line_yield_a_parsable_expression() {
        let line = "let (inc, dbl) = (|x: i32| x + 1, |y: i32| y * 2);";
        let sig = signature_of(&CallableSource::inline(line)).unwrap();
        assert!(syn::parse_str::<syn::Expr>(&sig).is_ok());
        assert_eq!(sig, "|x: i32| x + 1");
    }

    #[test]
    fn move_closures_keep_the_keyword() {
        let line = "spawn(move |ctx| ctx.run(), other);";
        assert_eq!(
            signature_of(&CallableSource::inline(line)).unwrap(),
            "move |ctx| ctx.run()"
        );
    }

    #[test]
    fn lines_without_closures_have_no_signature() {
        assert!(signature_of(&CallableSource::inline("let x = 5;")).is_none());
    }

    #[test]
    fn location_reads_the_line_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "fn main() {{").unwrap();
        writeln!(file, "    let f = |name: &str| name.len();").unwrap();
        writeln!(file, "}}").unwrap();

        let source = CallableSource::Location {
            file: file.path().to_string_lossy().to_string(),
            line: 2,
        };
        assert_eq!(signature_of(&source).unwrap(), "|name: &str| name.len()");

        let missing = CallableSource::Location {
            file: file.path().to_string_lossy().to_string(),
            line: 40,
        };
        assert!(signature_of(&missing).is_none());
    }

    #[test]
    fn inline_source_macro_captures_its_line() {
        let (inc, source) = (|n: u32| n + 1, crate::inline_source!());
        assert_eq!(inc(1), 2);
        assert_eq!(signature_of(&source).unwrap(), "|n: u32| n + 1");
    }
}

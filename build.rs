use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding the crate's own Rust sources. Nothing outside them is
// scanned.
const SOURCE_DIRS: [&str; 4] = ["src", "ipca", "tests", "benches"];

// Collects every matching line of one file for a single lint.
struct LintCollector {
    lint: Lint,
    file_path: PathBuf,
    violations: Vec<String>,
}

#[derive(Clone, Copy)]
enum Lint {
    UnderscorePrefix,
    ForbiddenCommentWord,
    StarsInComment,
    UppercaseComment,
    AllowDeadCode,
}

impl Lint {
    fn pattern(self) -> &'static str {
        match self {
            Lint::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b",
            Lint::ForbiddenCommentWord => {
                r"(//|/\*|///).*(?:FIXED|CORRECTED|FIX|NEW|CHANGED|CHANGE|MODIFIED|MODIFY|UPDATED|UPDATE)"
            }
            Lint::StarsInComment => r"(//|/\*).*\*\*",
            Lint::UppercaseComment => r"(//|/\*|///).*",
            Lint::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Lint::UnderscorePrefix => "underscore-prefixed variables",
            Lint::ForbiddenCommentWord => "change-log words in comments",
            Lint::StarsInComment => "'**' emphasis in non-doc comments",
            Lint::UppercaseComment => "all-uppercase comments",
            Lint::AllowDeadCode => "#[allow(dead_code)] attributes",
        }
    }

    fn advice(self) -> &'static str {
        match self {
            Lint::UnderscorePrefix => {
                "Either use the variable (removing the underscore) or remove it completely."
            }
            Lint::ForbiddenCommentWord | Lint::StarsInComment | Lint::UppercaseComment => {
                "Comments describe the code as it is, in plain sentence case."
            }
            Lint::AllowDeadCode => {
                "Either use the code (removing the attribute) or remove it completely."
            }
        }
    }

    fn applies_to_build_script(self) -> bool {
        matches!(self, Lint::UnderscorePrefix)
    }
}

impl LintCollector {
    fn new(lint: Lint, file_path: &Path) -> Self {
        Self {
            lint,
            file_path: file_path.to_path_buf(),
            violations: Vec::new(),
        }
    }

    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.lint.describe(),
            file_name
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!(
            "\n⚠️ {} are not allowed in this project.\n   {}\n",
            self.lint.describe(),
            self.lint.advice()
        ));
        Some(error_msg)
    }

    fn is_violation(&self, line_text: &str) -> bool {
        let trimmed = line_text.trim_start();
        let is_comment = trimmed.starts_with("//") || line_text.contains("/*");
        match self.lint {
            Lint::UnderscorePrefix => !is_comment && !underscore_only_in_strings(line_text),
            Lint::ForbiddenCommentWord | Lint::AllowDeadCode => true,
            Lint::StarsInComment => !trimmed.starts_with("///") && !trimmed.starts_with("//!"),
            Lint::UppercaseComment => {
                let comment_text = comment_body(trimmed);
                let alpha: Vec<char> = comment_text.chars().filter(|c| c.is_alphabetic()).collect();
                is_comment && !alpha.is_empty() && alpha.iter().all(|c| c.is_uppercase())
            }
        }
    }
}

impl Sink for LintCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.is_violation(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

// True when every underscore identifier on the line sits inside a string
// literal.
fn underscore_only_in_strings(line_text: &str) -> bool {
    if !line_text.contains('"') {
        return false;
    }
    line_text
        .split('"')
        .enumerate()
        .filter(|(i, _)| i % 2 == 0)
        .all(|(_, code)| !code.split(|c: char| !c.is_alphanumeric() && c != '_').any(|w| {
            w.starts_with('_') && w.len() > 1
        }))
}

fn comment_body(trimmed: &str) -> &str {
    if let Some(rest) = trimmed.strip_prefix("///") {
        rest.trim()
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        rest.trim()
    } else if let Some(idx) = trimmed.find("/*") {
        let rest = &trimmed[idx + 2..];
        match rest.find("*/") {
            Some(end) => rest[..end].trim(),
            None => rest.trim(),
        }
    } else {
        ""
    }
}

fn rust_sources() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .filter(|dir| Path::new(dir).is_dir())
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn scan(lint: Lint, files: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(lint.pattern())?;
    let mut searcher = Searcher::new();
    let build_script = PathBuf::from("build.rs");
    let extra = lint.applies_to_build_script().then_some(&build_script);

    for path in files.iter().chain(extra) {
        let mut collector = LintCollector::new(lint, path);
        searcher.search_path(&matcher, path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message() {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let files = rust_sources();
    for lint in [
        Lint::UnderscorePrefix,
        Lint::ForbiddenCommentWord,
        Lint::StarsInComment,
        Lint::UppercaseComment,
        Lint::AllowDeadCode,
    ] {
        if let Err(e) = scan(lint, &files) {
            // The message must reach cargo's output before the build fails.
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

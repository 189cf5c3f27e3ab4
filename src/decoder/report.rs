//! Report assembly.
//!
//! Lines are made of tagged spans. The tags say what a piece of text *is*
//! (an address, a function name, an error); the presentation layer decides
//! how it looks. Plain text and HTML renderings are provided here.

use serde::Serialize;

use super::exceptions::ExceptionInfo;
use super::parser::{SymbolKind, SymbolRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tag {
    Plain,
    Label,
    Address,
    FunctionName,
    FilePath,
    FileName,
    LineNumber,
    Error,
    Decorative,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Span {
    pub tag: Tag,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportLine {
    pub spans: Vec<Span>,
}

impl ReportLine {
    fn push(&mut self, tag: Tag, text: impl Into<String>) -> &mut Self {
        self.spans.push(Span { tag, text: text.into() });
        self
    }

    pub fn text(&self) -> String {
        self.spans.iter().map(|s| s.text.as_str()).collect()
    }

    pub fn has_tag(&self, tag: Tag) -> bool {
        self.spans.iter().any(|s| s.tag == tag)
    }
}

/// What a single report line describes
#[derive(Debug, Clone, Copy)]
pub enum LineKind<'a> {
    Exception(&'a ExceptionInfo),
    Register {
        name: &'a str,
        raw: &'a str,
        record: Option<&'a SymbolRecord>,
    },
    AllocationFailure {
        size: u64,
        record: &'a SymbolRecord,
    },
    Symbol(&'a SymbolRecord),
    Heading(&'a str),
}

/// Render one line
pub fn format(kind: LineKind<'_>) -> ReportLine {
    let mut line = ReportLine::default();
    match kind {
        LineKind::Exception(info) => {
            line.push(Tag::Error, format!("Exception {}: {}", info.code, info.description));
        }
        LineKind::Register { name, raw, record } => {
            line.push(Tag::Label, format!("{}: ", name));
            match record {
                Some(record) if record.is_resolved() => push_symbol(&mut line, record),
                _ => {
                    line.push(Tag::Address, format!("0x{}", raw));
                }
            }
        }
        LineKind::AllocationFailure { size, record } => {
            line.push(Tag::Error, format!("Memory allocation of {} bytes failed at ", size));
            push_symbol(&mut line, record);
        }
        LineKind::Symbol(record) => push_symbol(&mut line, record),
        LineKind::Heading(text) => {
            line.push(Tag::Decorative, text);
        }
    }
    line
}

fn push_symbol(line: &mut ReportLine, record: &SymbolRecord) {
    match record.kind {
        SymbolKind::Direct => {
            line.push(Tag::Address, format!("0x{}", record.address));
            if !record.is_resolved() {
                return;
            }
            line.push(Tag::Plain, ": ");
        }
        SymbolKind::Inlined => {
            line.push(Tag::Decorative, "  (inlined by) ");
        }
    }

    line.push(Tag::FunctionName, record.function_name.as_str());
    if record.file_path.is_empty() {
        return;
    }

    line.push(Tag::Plain, " at ");
    let (dir, name) = split_file_name(&record.file_path);
    if !dir.is_empty() {
        line.push(Tag::FilePath, dir);
    }
    line.push(Tag::FileName, name);

    if !record.line_number.is_empty() {
        line.push(Tag::Plain, " line ");
        line.push(Tag::LineNumber, record.line_number.as_str());
    }
}

/// Split at the last `/` or `\`, keeping the separator on the directory side
fn split_file_name(path: &str) -> (&str, &str) {
    match path.rfind(|c: char| c == '/' || c == '\\') {
        Some(index) => path.split_at(index + 1),
        None => ("", path),
    }
}

/// Which log section a fragment came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Exception,
    Registers,
    Allocation,
    Stack,
}

/// Lines contributed by one section, in extraction order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportFragment {
    pub section: SectionKind,
    pub lines: Vec<ReportLine>,
}

impl ReportFragment {
    pub fn new(section: SectionKind) -> Self {
        Self { section, lines: Vec::new() }
    }
}

/// Fragments in fixed section order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Report {
    pub fragments: Vec<ReportFragment>,
}

impl Report {
    pub fn lines(&self) -> impl Iterator<Item = &ReportLine> {
        self.fragments.iter().flat_map(|f| f.lines.iter())
    }

    /// Lines that carry a resolved function name
    pub fn symbol_line_count(&self) -> usize {
        self.lines().filter(|l| l.has_tag(Tag::FunctionName)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.iter().all(|f| f.lines.is_empty())
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for line in self.lines() {
            out.push_str(&line.text());
            out.push('\n');
        }
        out
    }

    pub fn render_html(&self) -> String {
        let mut out = String::new();
        for line in self.lines() {
            for span in &line.spans {
                let text = escape_html(&span.text);
                let rendered = match span.tag {
                    Tag::Plain | Tag::Label | Tag::FilePath | Tag::Decorative => text,
                    Tag::Address => format!("<font color=green>{}</font>", text),
                    Tag::FunctionName => format!("<b><font color=blue>{}</font></b>", text),
                    Tag::FileName | Tag::LineNumber => format!("<b>{}</b>", text),
                    Tag::Error => format!("<b><font color=red>{}</font></b>", text),
                };
                out.push_str(&rendered);
            }
            out.push('\n');
        }
        out
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

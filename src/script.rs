//! Source-to-source rewriting of JavaScript so that reads of the page
//! location go through the proxy-aware stand-in installed by the injected
//! head script.
//!
//! Two passes run over the text:
//!
//! * `window.location` / `document.location` member accesses are replaced
//!   everywhere. They cannot mean anything else.
//! * For inline scripts only, bare `location` identifiers are replaced when
//!   none of the binding/property predicates below match. This pass skips
//!   string literals, template literals, comments and regex literals.
//!
//! Each predicate looks at a bounded window of text around the identifier
//! plus the bracket nesting recorded during the scan, so a pathological file
//! cannot make a single decision expensive.

use std::{borrow::Cow, sync::LazyLock};

use regex::Regex;

/// Global name of the stand-in object.
pub const STAND_IN: &str = "__cmuxLocation";
const STAND_IN_PREFIX: &str = "__cmux";
const STAND_IN_REF: &str = "window.__cmuxLocation";

/// Text containing this token has already been through the gateway.
pub const NO_REWRITE_MARKER: &str = "__CMUX_NO_REWRITE__";

/// Prepended to external files. Pages load the head script first, but
/// workers and early module graphs can reach a rewritten file before it runs.
/// Kept on one line so source map line numbers stay valid.
pub const EXTERNAL_GUARD: &str = "/* __CMUX_NO_REWRITE__ */(function(){if(typeof window==='undefined'||Object.prototype.hasOwnProperty.call(window,'__cmuxLocation'))return;Object.defineProperty(window,'__cmuxLocation',{configurable:true,get:function(){return window.location;},set:function(v){window.location.href=v;}});})();";

const LOOK_BEHIND: usize = 96;
const LOOK_AHEAD: usize = 96;

static GLOBAL_LOCATION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b(?:window|document)\.location\b").ok());

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptSource {
    /// A file fetched on its own (`<script src>`, `import`, worker).
    External,
    /// Script text embedded in a proxied HTML page.
    Inline,
}

pub fn rewrite_script(source: &str, kind: ScriptSource) -> Cow<'_, str> {
    if source.contains(NO_REWRITE_MARKER) {
        return Cow::Borrowed(source);
    }

    let mut text = replace_global_location(source);
    if kind == ScriptSource::Inline {
        text = replace_bare_location(&text);
    }
    let text = collapse_double_substitution(&text);

    match kind {
        ScriptSource::External => {
            let mut out = String::with_capacity(EXTERNAL_GUARD.len() + text.len());
            out.push_str(EXTERNAL_GUARD);
            out.push_str(&text);
            Cow::Owned(out)
        }
        ScriptSource::Inline if text == source => Cow::Borrowed(source),
        ScriptSource::Inline => Cow::Owned(text),
    }
}

fn replace_global_location(source: &str) -> String {
    let Some(pattern) = GLOBAL_LOCATION.as_ref() else {
        return source.to_owned();
    };
    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len());
    let mut last = 0;
    for found in pattern.find_iter(source) {
        // `\b` treats `$` as a boundary; `$window.location` is someone else's
        // identifier.
        if found.start() > 0 && is_ident_byte(bytes[found.start() - 1]) {
            continue;
        }
        out.push_str(&source[last..found.start()]);
        out.push_str(STAND_IN_REF);
        last = found.end();
    }
    out.push_str(&source[last..]);
    out
}

fn collapse_double_substitution(text: &str) -> String {
    text.replace("window.window.__cmuxLocation", STAND_IN_REF)
        .replace("window.__cmux__cmuxLocation", STAND_IN_REF)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Bracket {
    Paren,
    Square,
    Curly,
    ClassBody,
}

/// An unclosed bracket and the byte offset it was opened at.
#[derive(Clone, Copy, Debug)]
struct Frame {
    kind: Bracket,
    at: usize,
}

/// Bracket nesting seen so far in the scan. Openers are remembered at any
/// distance, so list and class-body positions do not depend on the
/// look-behind window.
#[derive(Debug, Default)]
struct Nesting {
    frames: Vec<Frame>,
    /// Depth of the `let`/`const`/`var` statement currently open, if any.
    declaration_depth: Option<usize>,
    /// Saw `class` and have not reached its body yet.
    class_pending: bool,
}

impl Nesting {
    fn open(&mut self, byte: u8, at: usize) {
        let kind = match byte {
            b'(' => Bracket::Paren,
            b'[' => Bracket::Square,
            _ if std::mem::take(&mut self.class_pending) => Bracket::ClassBody,
            _ => Bracket::Curly,
        };
        self.frames.push(Frame { kind, at });
    }

    fn close(&mut self) {
        self.frames.pop();
        if self.declaration_depth.is_some_and(|depth| depth > self.frames.len()) {
            self.declaration_depth = None;
        }
    }

    fn end_statement(&mut self) {
        if self.declaration_depth == Some(self.frames.len()) {
            self.declaration_depth = None;
        }
        self.class_pending = false;
    }

    fn keyword(&mut self, word: &str) {
        match word {
            "let" | "const" | "var" => self.declaration_depth = Some(self.frames.len()),
            "class" => self.class_pending = true,
            _ => {}
        }
    }

    fn innermost(&self) -> Option<Frame> {
        self.frames.last().copied()
    }

    fn in_declaration_list(&self) -> bool {
        self.declaration_depth == Some(self.frames.len())
    }
}

fn replace_bare_location(source: &str) -> String {
    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len());
    let mut last = 0;
    let mut i = 0;
    let mut nesting = Nesting::default();
    // Last significant byte of code seen, used to tell regex literals from
    // division.
    let mut prev_significant: Option<u8> = None;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'\'' | b'"' => {
                i = skip_quoted(bytes, i, b);
                prev_significant = Some(b);
            }
            b'`' => {
                i = skip_quoted(bytes, i, b'`');
                prev_significant = Some(b);
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                i = skip_line_comment(bytes, i);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = skip_block_comment(bytes, i);
            }
            b'/' if starts_regex(prev_significant) => {
                i = skip_regex(bytes, i);
                prev_significant = Some(b'/');
            }
            b'0'..=b'9' => {
                while i < bytes.len() && (is_ident_byte(bytes[i]) || bytes[i] == b'.') {
                    i += 1;
                }
                prev_significant = Some(b'0');
            }
            _ if is_ident_byte(b) => {
                let start = i;
                while i < bytes.len() && is_ident_byte(bytes[i]) {
                    i += 1;
                }
                let word = &source[start..i];
                if prev_significant != Some(b'.')
                    && first_significant(&bytes[i..]) != Some(b':')
                {
                    nesting.keyword(word);
                }
                if word == "location" && should_rewrite(bytes, start, i, &nesting) {
                    out.push_str(&source[last..start]);
                    out.push_str(STAND_IN_REF);
                    last = i;
                }
                prev_significant = Some(if is_keyword_before_expression(word) {
                    b'('
                } else {
                    b'a'
                });
            }
            _ => {
                match b {
                    b'(' | b'[' | b'{' => nesting.open(b, i),
                    b')' | b']' | b'}' => nesting.close(),
                    b';' => nesting.end_statement(),
                    _ => {}
                }
                if !b.is_ascii_whitespace() {
                    prev_significant = Some(b);
                }
                i += 1;
            }
        }
    }
    out.push_str(&source[last..]);
    out
}

fn should_rewrite(bytes: &[u8], start: usize, end: usize, nesting: &Nesting) -> bool {
    let before = &bytes[start.saturating_sub(LOOK_BEHIND)..start];
    let after = &bytes[end..bytes.len().min(end + LOOK_AHEAD)];

    // Element of a bracketed list: `{ a, location }`, `(a, location)`.
    let list = if matches!(last_significant(before), Some(b'{' | b'[' | b'(' | b',')) {
        match nesting.innermost() {
            Some(frame) => Some(frame),
            None => return false,
        }
    } else {
        None
    };

    !(is_declaration(before)
        || is_declaration_list_entry(before, nesting)
        || is_destructuring(bytes, list, after)
        || is_parameter(bytes, list, after)
        || is_property_access(before)
        || is_object_key(after)
        || is_member_name(before, after)
        || is_class_member(before, nesting)
        || is_already_substituted(before))
}

/// `const location`, `let location`, `var location`, and named
/// functions/classes.
fn is_declaration(before: &[u8]) -> bool {
    let word = last_word(before);
    matches!(word, b"const" | b"let" | b"var" | b"function" | b"class")
}

/// `let a = 1, location = 2`.
fn is_declaration_list_entry(before: &[u8], nesting: &Nesting) -> bool {
    nesting.in_declaration_list() && last_significant(before) == Some(b',')
}

/// `{ location }` / `{ a, location = x }` binding or shorthand, and
/// `[a, location] = ...` array patterns.
fn is_destructuring(bytes: &[u8], list: Option<Frame>, after: &[u8]) -> bool {
    let Some(frame) = list else {
        return false;
    };
    let next = first_significant(after);
    let ends_element = matches!(next, Some(b'}' | b',' | b']')) || starts_with_assignment(after);
    match frame.kind {
        Bracket::Curly | Bracket::ClassBody => ends_element,
        Bracket::Square => {
            ends_element
                && (is_declaration(text_before(bytes, frame.at))
                    || closing_followed_by_assignment(after).unwrap_or(true))
        }
        Bracket::Paren => false,
    }
}

/// A parameter of a function, arrow function, method, or catch clause.
fn is_parameter(bytes: &[u8], list: Option<Frame>, after: &[u8]) -> bool {
    if starts_with_arrow(after) {
        return true;
    }
    let Some(frame) = list else {
        return false;
    };
    if frame.kind != Bracket::Paren {
        return false;
    }
    let next = first_significant(after);
    if !(matches!(next, Some(b')' | b',')) || starts_with_assignment(after)) {
        return false;
    }

    let head = text_before(bytes, frame.at);
    let callee = last_word(head);
    if callee == b"function" || last_word(strip_last_word(head)) == b"function" {
        return true;
    }
    if callee == b"catch" {
        return true;
    }
    if matches!(callee, b"if" | b"while" | b"for" | b"switch" | b"with" | b"return") {
        return false;
    }
    match rest_after_closing(after) {
        Some(rest) => starts_with_arrow(rest) || first_significant(rest) == Some(b'{'),
        None => true,
    }
}

/// `foo.location`, `foo?.location`, `...location`.
fn is_property_access(before: &[u8]) -> bool {
    last_significant(before) == Some(b'.')
}

/// `{ location: ... }`. Also leaves ternaries and labels alone.
fn is_object_key(after: &[u8]) -> bool {
    first_significant(after) == Some(b':')
}

/// Method and accessor names: `location() {}`, `get location() {}`,
/// `static location`. The real `Location` is not callable, so any
/// `location(` belongs to someone else.
fn is_member_name(before: &[u8], after: &[u8]) -> bool {
    first_significant(after) == Some(b'(')
        || matches!(last_word(before), b"get" | b"set" | b"static" | b"async")
}

/// Field names directly inside a class body. Initializer expressions
/// (`a = location.href`) follow an operator and are still rewritten.
fn is_class_member(before: &[u8], nesting: &Nesting) -> bool {
    nesting
        .innermost()
        .is_some_and(|frame| frame.kind == Bracket::ClassBody)
        && !matches!(
            last_significant(before),
            Some(
                b'=' | b'(' | b'[' | b',' | b'?' | b':' | b'+' | b'-' | b'*' | b'/' | b'%' | b'!'
                    | b'&' | b'|' | b'<' | b'>' | b'^' | b'~'
            )
        )
}

fn is_already_substituted(before: &[u8]) -> bool {
    before.ends_with(STAND_IN_PREFIX.as_bytes())
}

fn text_before(bytes: &[u8], at: usize) -> &[u8] {
    &bytes[at.saturating_sub(LOOK_BEHIND)..at]
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

fn is_keyword_before_expression(word: &str) -> bool {
    matches!(
        word,
        "return" | "typeof" | "case" | "do" | "else" | "in" | "of" | "new" | "delete" | "void"
            | "throw" | "yield" | "await" | "instanceof"
    )
}

fn starts_regex(prev: Option<u8>) -> bool {
    match prev {
        None => true,
        Some(b) => matches!(
            b,
            b'(' | b',' | b'=' | b':' | b'[' | b'!' | b'&' | b'|' | b'?' | b'{' | b'}' | b';'
                | b'+' | b'-' | b'*' | b'%' | b'<' | b'>' | b'~' | b'^'
        ),
    }
}

fn skip_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return i + 1,
            b'\n' if quote != b'`' => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

fn skip_line_comment(bytes: &[u8], start: usize) -> usize {
    bytes[start..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(bytes.len(), |pos| start + pos + 1)
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    bytes[start + 2..]
        .windows(2)
        .position(|w| w == b"*/")
        .map_or(bytes.len(), |pos| start + 2 + pos + 2)
}

fn skip_regex(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 1;
    let mut in_class = false;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'[' => {
                in_class = true;
                i += 1;
            }
            b']' => {
                in_class = false;
                i += 1;
            }
            b'/' if !in_class => {
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
                    i += 1;
                }
                return i;
            }
            b'\n' => return i,
            _ => i += 1,
        }
    }
    bytes.len()
}

fn first_significant(after: &[u8]) -> Option<u8> {
    after.iter().copied().find(|b| !b.is_ascii_whitespace())
}

fn last_significant(before: &[u8]) -> Option<u8> {
    before.iter().rev().copied().find(|b| !b.is_ascii_whitespace())
}

fn trim_end(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |pos| pos + 1);
    &bytes[..end]
}

/// The identifier immediately preceding the window end, ignoring whitespace.
fn last_word(before: &[u8]) -> &[u8] {
    let trimmed = trim_end(before);
    let start = trimmed
        .iter()
        .rposition(|&b| !is_ident_byte(b))
        .map_or(0, |pos| pos + 1);
    &trimmed[start..]
}

fn strip_last_word(before: &[u8]) -> &[u8] {
    let trimmed = trim_end(before);
    let word = last_word(trimmed);
    &trimmed[..trimmed.len() - word.len()]
}

fn starts_with_assignment(after: &[u8]) -> bool {
    let trimmed = trim_start(after);
    trimmed.first() == Some(&b'=') && !matches!(trimmed.get(1), Some(b'=' | b'>'))
}

fn starts_with_arrow(after: &[u8]) -> bool {
    trim_start(after).starts_with(b"=>")
}

fn trim_start(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

/// Text following the bracket that closes the list the identifier is in.
fn rest_after_closing(after: &[u8]) -> Option<&[u8]> {
    let mut depth = 0usize;
    for (idx, &b) in after.iter().enumerate() {
        match b {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => {
                if depth == 0 {
                    return Some(&after[idx + 1..]);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

/// `None` when the closing bracket is past the look-ahead window.
fn closing_followed_by_assignment(after: &[u8]) -> Option<bool> {
    rest_after_closing(after).map(starts_with_assignment)
}

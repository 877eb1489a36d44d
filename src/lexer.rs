/// Scanner for the Quill source language.
///
/// Produces raw tokens from the input-source stack:
///   • parenthesized list tokens and the other single-character tokens
///   • identifiers (terminated per the character-class table)
///   • numbers with optional `%` (binary) and `$` (hex) prefixes
///   • strings delimited by `"` or `{`...`}`, with `_` → space, escapes,
///     and whitespace folding across line breaks
///   • character constants `` `x ``, `` `^X ``, `` `@x ``, `` `#N ``
///   • `;` comments
///
/// Identifier tokens bound to a `define` replay their raw body through a
/// string input source.  Line-level `#if` conditional compilation runs
/// here, underneath the token stream.

use crate::chartype::*;
use crate::diagnostics::DiagnosticEngine;
use crate::errors::{FatalError, PResult};
use crate::input::InputStack;
use crate::symbol::{Payload, SymType, SymbolId};
use crate::symtab::SymTbls;

pub const MAX_TOKEN_LEN: usize = 2048;

const ALT_KEY: [i32; 26] = [
    30, 48, 46, 32, 18, 33, 34, 35, 23, // a - i
    36, 37, 38, 50, 49, 24, 25, 16, 19, // j - r
    31, 20, 22, 47, 17, 45, 21, 44, // s - z
];

/// The current token: type tag, lexeme, value, and (after lookup) the
/// symbol it resolved to.
#[derive(Debug, Clone, Default)]
pub struct TokenSlot {
    pub ty: SymType,
    pub text: String,
    pub val: i32,
    pub sym: Option<SymbolId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Directive {
    None,
    If,
    IfDef,
    IfNDef,
    Elif,
    ElifDef,
    ElifNDef,
    Else,
    EndIf,
}

pub struct Lexer {
    pub input: InputStack,
    pub tok: TokenSlot,
    have_unget: bool,
    /// Open `#if` nesting depth, checked at end of unit.
    pub nested_cond: u32,
}

impl Lexer {
    pub fn new() -> Self {
        Lexer {
            input: InputStack::new(),
            tok: TokenSlot::default(),
            have_unget: false,
            nested_cond: 0,
        }
    }

    pub fn cur_file(&self) -> String {
        self.input.cur_file()
    }

    pub fn cur_line(&self) -> u32 {
        self.input.cur_line()
    }

    /// Push the current token back; the next fetch returns it again.
    pub fn unget(&mut self) {
        self.have_unget = true;
    }

    /// Raw token fetch.  Returns false at end of input.
    pub fn next_token(
        &mut self,
        syms: &SymTbls,
        diags: &mut DiagnosticEngine,
    ) -> PResult<bool> {
        if self.have_unget {
            self.have_unget = false;
            return Ok(true);
        }

        // Scan to the start of the next token, crossing line and source
        // boundaries.
        loop {
            if self.input.is_empty() {
                self.tok = TokenSlot {
                    ty: SymType::End,
                    ..Default::default()
                };
                return Ok(false);
            }
            if self.input.at_line_end() {
                if self.input.top_is_str() {
                    self.input.pop();
                } else if !self.get_new_line(syms, diags)? {
                    self.input.pop();
                }
                continue;
            }

            let c = self.input.cur().unwrap();
            if !is_sep(c) {
                break;
            }
            if c == b';' {
                self.input.skip_to_line_end();
            } else {
                self.input.advance();
            }
        }

        let c = self.input.cur().unwrap();
        self.tok = TokenSlot::default();

        if is_tok(c) {
            self.input.advance();
            self.tok.text.push(c as char);
            self.tok.ty = match c {
                b'(' => SymType::OpenP,
                b')' => SymType::CloseP,
                b'[' => SymType::OpenBracket,
                b']' => SymType::CloseBracket,
                b',' => SymType::Comma,
                b'#' => SymType::Hash,
                b'@' => SymType::At,
                _ => SymType::Dot,
            };
            return Ok(true);
        }

        if c == b'`' {
            self.input.advance();
            self.read_key(diags);
            return Ok(true);
        }

        if c == b'"' || c == b'{' {
            self.read_string(syms, diags)?;
            return Ok(true);
        }

        if is_digit_start(c) || (c == b'-' && self.input.peek(1).map_or(false, is_digit_start)) {
            self.read_number(diags);
            return Ok(true);
        }

        // An identifier, terminated per the character-class table.
        self.tok.ty = SymType::Ident;
        while let Some(c) = self.input.cur() {
            if is_term(c) {
                break;
            }
            self.input.advance();
            if c == b':' {
                self.tok.ty = SymType::SelectLit;
                break;
            }
            if is_incl(c) {
                break;
            }
            self.tok.text.push(c as char);
        }
        Ok(true)
    }

    /// Token fetch with `define` replacement: an identifier bound to a
    /// define replays its body through a string source.
    pub fn new_token(&mut self, syms: &SymTbls, diags: &mut DiagnosticEngine) -> PResult<bool> {
        loop {
            if !self.next_token(syms, diags)? {
                return Ok(false);
            }
            if self.tok.ty == SymType::Ident {
                if let Some(id) = syms.lookup(&self.tok.text) {
                    let sym = syms.get(id);
                    if sym.ty == SymType::Define {
                        if let Payload::Text(body) = &sym.payload {
                            self.input.push_str(&body.clone());
                            continue;
                        }
                    }
                }
            }
            return Ok(true);
        }
    }

    /// Like `new_token`, but running out of input is fatal.
    pub fn get_token(&mut self, syms: &SymTbls, diags: &mut DiagnosticEngine) -> PResult<()> {
        if !self.new_token(syms, diags)? {
            return Err(FatalError::EarlyEnd.into());
        }
        Ok(())
    }

    /// Copy the rest of the parenthesized expression into the token text,
    /// leaving the closing parenthesis unconsumed.  With `skipping`, this
    /// is the error-recovery "eat rest" hook and further diagnostics stay
    /// quiet.
    pub fn get_rest(
        &mut self,
        skipping: bool,
        syms: &SymTbls,
        diags: &mut DiagnosticEngine,
    ) -> PResult<()> {
        let mut body = String::new();
        let mut level = 0u32;
        let mut truncated = false;

        loop {
            if self.input.is_empty() {
                if !skipping {
                    return Err(FatalError::EarlyEnd.into());
                }
                break;
            }
            if self.input.at_line_end() {
                if self.input.top_is_str() {
                    self.input.pop();
                } else if !self.get_new_line(syms, diags)? {
                    self.input.pop();
                }
                continue;
            }
            let c = self.input.cur().unwrap();
            match c {
                b'(' => level += 1,
                b')' => {
                    if level == 0 {
                        break;
                    }
                    level -= 1;
                }
                _ => {}
            }
            self.input.advance();
            if !truncated {
                body.push(c as char);
                if body.len() >= MAX_TOKEN_LEN {
                    if !skipping {
                        diags.warning(
                            &self.cur_file(),
                            self.cur_line(),
                            "Define too long.  Truncated.",
                        );
                    }
                    truncated = true;
                }
            }
        }

        self.tok = TokenSlot {
            ty: SymType::Str,
            text: body,
            val: 0,
            sym: None,
        };
        Ok(())
    }

    // ── numbers ──────────────────────────────────────────────────────────

    fn read_number(&mut self, diags: &mut DiagnosticEngine) {
        self.tok.ty = SymType::Num;

        let mut sign = 1i32;
        if self.input.cur() == Some(b'-') {
            sign = -1;
            self.tok.text.push('-');
            self.input.advance();
        }

        let base: i32 = match self.input.cur() {
            Some(b'%') => {
                self.tok.text.push('%');
                self.input.advance();
                2
            }
            Some(b'$') => {
                self.tok.text.push('$');
                self.input.advance();
                16
            }
            _ => 10,
        };

        let mut val: i16 = 0;
        while let Some(c) = self.input.cur() {
            if is_term(c) {
                break;
            }
            let digit = (c as char).to_ascii_lowercase().to_digit(base as u32);
            match digit {
                Some(d) => {
                    val = val.wrapping_mul(base as i16).wrapping_add(d as i16);
                    self.tok.text.push(c as char);
                    self.input.advance();
                }
                None => {
                    diags.warning(
                        &self.cur_file(),
                        self.cur_line(),
                        &format!(
                            "Invalid character in number: {}.  Number = {}",
                            c as char, val
                        ),
                    );
                    break;
                }
            }
        }

        self.tok.val = (val as i32).wrapping_mul(sign) as i16 as i32;
    }

    // ── strings ──────────────────────────────────────────────────────────

    /// Next raw character of a string literal; line breaks read on as a
    /// newline character.  Running out of input is an unterminated string.
    fn string_char(
        &mut self,
        syms: &SymTbls,
        diags: &mut DiagnosticEngine,
    ) -> PResult<Option<u8>> {
        if self.input.at_line_end() {
            let more = if self.input.top_is_str() {
                false
            } else {
                self.get_new_line(syms, diags)?
            };
            if !more {
                return Ok(None);
            }
            return Ok(Some(b'\n'));
        }
        Ok(self.input.advance())
    }

    fn read_string(&mut self, syms: &SymTbls, diags: &mut DiagnosticEngine) -> PResult<()> {
        self.tok.ty = SymType::Str;
        let open = self.input.advance().unwrap();
        let close = if open == b'{' { b'}' } else { open };
        let mut truncated = false;

        loop {
            let Some(c) = self.string_char(syms, diags)? else {
                return Err(FatalError::UnterminatedString.into());
            };
            if c == close {
                break;
            }
            match c {
                b'\n' | b'\r' => {}
                b'_' => {
                    if !truncated {
                        self.tok.text.push(' ');
                    }
                }
                b' ' | b'\t' => {
                    // Fold whitespace runs (across line breaks) into a
                    // single space.
                    if !truncated && !self.tok.text.is_empty() && !self.tok.text.ends_with('\n') {
                        self.tok.text.push(' ');
                    }
                    while let Some(c) = self.input.cur() {
                        if c != b' ' && c != b'\t' {
                            break;
                        }
                        self.input.advance();
                    }
                    if self.input.at_line_end() && !self.input.top_is_str() {
                        if !self.get_new_line(syms, diags)? {
                            return Err(FatalError::UnterminatedString.into());
                        }
                        self.input.skip_while(|c| c == b' ' || c == b'\t');
                    }
                }
                b'\\' => {
                    let Some(e) = self.string_char(syms, diags)? else {
                        return Err(FatalError::UnterminatedString.into());
                    };
                    if is_hex(e) {
                        let hi = (e as char).to_digit(16).unwrap_or(0);
                        let lo = self
                            .string_char(syms, diags)?
                            .and_then(|c| (c as char).to_digit(16))
                            .unwrap_or(0);
                        if !truncated {
                            self.tok.text.push((hi * 16 + lo) as u8 as char);
                        }
                    } else if !truncated {
                        match e {
                            b'n' => self.tok.text.push('\n'),
                            b't' => self.tok.text.push('\t'),
                            b'r' => {
                                self.tok.text.push('\r');
                                self.tok.text.push('\n');
                            }
                            _ => self.tok.text.push(e as char),
                        }
                    }
                }
                _ => {
                    if !truncated {
                        self.tok.text.push(c as char);
                    }
                }
            }

            if self.tok.text.len() >= MAX_TOKEN_LEN && !truncated {
                diags.error(&self.cur_file(), self.cur_line(), "String too large.");
                truncated = true;
            }
        }
        Ok(())
    }

    // ── character constants ──────────────────────────────────────────────

    fn read_key(&mut self, diags: &mut DiagnosticEngine) {
        self.tok.ty = SymType::Num;
        while let Some(c) = self.input.cur() {
            if is_term(c) {
                break;
            }
            self.tok.text.push(c as char);
            self.input.advance();
        }

        let bytes = self.tok.text.as_bytes();
        let Some(&first) = bytes.first() else {
            diags.error(&self.cur_file(), self.cur_line(), "Not a valid key.");
            return;
        };

        self.tok.val = match first {
            b'^' => match bytes.get(1) {
                Some(c) if c.is_ascii_alphabetic() => (c.to_ascii_uppercase() - 0x40) as i32,
                _ => {
                    diags.error(
                        &self.cur_file(),
                        self.cur_line(),
                        &format!("Not a valid control key: {}", self.tok.text),
                    );
                    0
                }
            },
            b'@' => match bytes.get(1) {
                Some(c) if c.is_ascii_alphabetic() => {
                    ALT_KEY[(c.to_ascii_uppercase() - b'A') as usize] << 8
                }
                _ => {
                    diags.error(
                        &self.cur_file(),
                        self.cur_line(),
                        &format!("Not a valid alt key: {}", self.tok.text),
                    );
                    0
                }
            },
            b'#' => match self.tok.text[1..].parse::<i32>() {
                Ok(num) => (num + 58) << 8,
                Err(_) => {
                    diags.error(
                        &self.cur_file(),
                        self.cur_line(),
                        &format!("Not a valid function key: {}", self.tok.text),
                    );
                    0
                }
            },
            c => c as i32,
        };
    }

    // ── conditional compilation ──────────────────────────────────────────

    fn directive(&mut self) -> (Directive, String) {
        let line = self.input.line_rest().trim_start();
        if !line.starts_with('#') {
            return (Directive::None, String::new());
        }
        // Longer names first so "#ifdef" is not read as "#if".
        const TABLE: [(&str, Directive); 8] = [
            ("#ifdef", Directive::IfDef),
            ("#ifndef", Directive::IfNDef),
            ("#if", Directive::If),
            ("#elifdef", Directive::ElifDef),
            ("#elifndef", Directive::ElifNDef),
            ("#elif", Directive::Elif),
            ("#else", Directive::Else),
            ("#endif", Directive::EndIf),
        ];
        for (text, d) in TABLE {
            if let Some(rest) = line.strip_prefix(text) {
                if rest.is_empty() || rest.starts_with(' ') || rest.starts_with('\t') {
                    let rest = rest.to_string();
                    self.input.set_line_consumed();
                    return (d, rest);
                }
            }
        }
        (Directive::None, String::new())
    }

    fn is_defined(&self, arg: &str, syms: &SymTbls) -> bool {
        let name = arg.trim().split_whitespace().next().unwrap_or("");
        syms.lookup(name)
            .map_or(false, |id| syms.get(id).ty == SymType::Define)
    }

    /// Read the next line of the current file, skipping regions excluded
    /// by conditional-compilation directives.  Returns false at end of
    /// file.
    pub fn get_new_line(&mut self, syms: &SymTbls, diags: &mut DiagnosticEngine) -> PResult<bool> {
        #[derive(PartialEq)]
        enum Mode {
            Compiling,
            NotCompiling,
            GettingEndif,
        }
        let mut mode = Mode::Compiling;
        let mut level = 0u32;

        loop {
            if !self.input.next_file_line() {
                return Ok(false);
            }
            let (d, rest) = self.directive();

            match mode {
                Mode::Compiling => match d {
                    Directive::None => return Ok(true),
                    Directive::If => {
                        self.nested_cond += 1;
                        if eval_const_line(&rest, syms) == 0 {
                            mode = Mode::NotCompiling;
                            level = 0;
                        }
                    }
                    Directive::IfDef => {
                        self.nested_cond += 1;
                        if !self.is_defined(&rest, syms) {
                            mode = Mode::NotCompiling;
                            level = 0;
                        }
                    }
                    Directive::IfNDef => {
                        self.nested_cond += 1;
                        if self.is_defined(&rest, syms) {
                            mode = Mode::NotCompiling;
                            level = 0;
                        }
                    }
                    Directive::Elif | Directive::ElifDef | Directive::ElifNDef | Directive::Else => {
                        if self.nested_cond == 0 {
                            diags.error(
                                &self.cur_file(),
                                self.cur_line(),
                                "#else/#elif without corresponding #if",
                            );
                        } else {
                            mode = Mode::GettingEndif;
                            level = 0;
                        }
                    }
                    Directive::EndIf => {
                        if self.nested_cond == 0 {
                            diags.error(
                                &self.cur_file(),
                                self.cur_line(),
                                "#endif without corresponding #if",
                            );
                        } else {
                            self.nested_cond -= 1;
                        }
                    }
                },

                Mode::NotCompiling => match d {
                    Directive::If | Directive::IfDef | Directive::IfNDef => level += 1,
                    Directive::Elif => {
                        if level == 0 && eval_const_line(&rest, syms) != 0 {
                            mode = Mode::Compiling;
                        }
                    }
                    Directive::ElifDef => {
                        if level == 0 && self.is_defined(&rest, syms) {
                            mode = Mode::Compiling;
                        }
                    }
                    Directive::ElifNDef => {
                        if level == 0 && !self.is_defined(&rest, syms) {
                            mode = Mode::Compiling;
                        }
                    }
                    Directive::Else => {
                        if level == 0 {
                            mode = Mode::Compiling;
                        }
                    }
                    Directive::EndIf => {
                        if level == 0 {
                            self.nested_cond = self.nested_cond.saturating_sub(1);
                            mode = Mode::Compiling;
                        } else {
                            level -= 1;
                        }
                    }
                    Directive::None => {}
                },

                Mode::GettingEndif => match d {
                    Directive::If | Directive::IfDef | Directive::IfNDef => level += 1,
                    Directive::EndIf => {
                        if level == 0 {
                            self.nested_cond = self.nested_cond.saturating_sub(1);
                            mode = Mode::Compiling;
                        } else {
                            level -= 1;
                        }
                    }
                    _ => {}
                },
            }
        }
    }
}

impl Default for Lexer {
    fn default() -> Self {
        Self::new()
    }
}

/// Constant-expression evaluator for `#if`/`#elif` arguments: numbers,
/// `define`d names, and parenthesized operator forms.
fn eval_const_line(s: &str, syms: &SymTbls) -> i32 {
    let mut p = ConstParser {
        bytes: s.as_bytes(),
        pos: 0,
        syms,
    };
    p.expr()
}

struct ConstParser<'a> {
    bytes: &'a [u8],
    pos: usize,
    syms: &'a SymTbls,
}

impl<'a> ConstParser<'a> {
    fn skip_ws(&mut self) {
        while self.pos < self.bytes.len() && (self.bytes[self.pos] as char).is_whitespace() {
            self.pos += 1;
        }
    }

    fn word(&mut self) -> String {
        let start = self.pos;
        while self.pos < self.bytes.len() {
            let c = self.bytes[self.pos];
            if is_term(c) || c == b'(' {
                break;
            }
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned()
    }

    fn expr(&mut self) -> i32 {
        self.skip_ws();
        if self.pos >= self.bytes.len() {
            return 0;
        }
        match self.bytes[self.pos] {
            b'(' => {
                self.pos += 1;
                self.skip_ws();
                let op = self.word();
                let mut args = Vec::new();
                loop {
                    self.skip_ws();
                    if self.pos >= self.bytes.len() || self.bytes[self.pos] == b')' {
                        self.pos = (self.pos + 1).min(self.bytes.len());
                        break;
                    }
                    args.push(self.expr());
                }
                apply_op(&op, &args)
            }
            _ => {
                let w = self.word();
                if w.is_empty() {
                    self.pos += 1;
                    return 0;
                }
                parse_number(&w).unwrap_or_else(|| self.lookup(&w))
            }
        }
    }

    fn lookup(&self, name: &str) -> i32 {
        match self.syms.lookup(name) {
            Some(id) => {
                let sym = self.syms.get(id);
                match (&sym.ty, &sym.payload) {
                    (SymType::Define, Payload::Text(body)) => eval_const_line(body, self.syms),
                    (SymType::Num, Payload::Int(v)) => *v,
                    _ => 0,
                }
            }
            None => 0,
        }
    }
}

fn parse_number(w: &str) -> Option<i32> {
    let (neg, w) = match w.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, w),
    };
    let (base, digits) = match w.as_bytes().first()? {
        b'%' => (2, &w[1..]),
        b'$' => (16, &w[1..]),
        _ => (10, w),
    };
    let v = i64::from_str_radix(digits, base).ok()? as i16 as i32;
    Some(if neg { -v } else { v })
}

fn apply_op(op: &str, args: &[i32]) -> i32 {
    let a = args.first().copied().unwrap_or(0);
    let b = args.get(1).copied().unwrap_or(0);
    match op {
        "+" => args.iter().sum(),
        "*" => args.iter().product(),
        "-" => {
            if args.len() < 2 {
                -a
            } else {
                a - b
            }
        }
        "/" => {
            if b != 0 {
                a / b
            } else {
                0
            }
        }
        "mod" => {
            if b != 0 {
                a % b
            } else {
                0
            }
        }
        "<<" => a << (b & 15),
        ">>" => a >> (b & 15),
        "^" => args.iter().fold(0, |x, y| x ^ y),
        "&" => args.iter().fold(-1, |x, y| x & y),
        "|" => args.iter().fold(0, |x, y| x | y),
        "and" => args.iter().all(|&v| v != 0) as i32,
        "or" => args.iter().any(|&v| v != 0) as i32,
        "not" => (a == 0) as i32,
        "~" => !a,
        "neg" => -a,
        ">" => (a > b) as i32,
        ">=" => (a >= b) as i32,
        "<" => (a < b) as i32,
        "<=" => (a <= b) as i32,
        "==" => (a == b) as i32,
        "!=" => (a != b) as i32,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(src: &str) -> Vec<TokenSlot> {
        let syms = SymTbls::new();
        let mut diags = DiagnosticEngine::new(false);
        let mut lex = Lexer::new();
        lex.input.push_file_text("t.sc", src);
        let mut out = Vec::new();
        while lex.next_token(&syms, &mut diags).unwrap() {
            out.push(lex.tok.clone());
        }
        out
    }

    #[test]
    fn scans_parens_idents_numbers() {
        let toks = lex_all("(door -42 $2f %101)");
        let kinds: Vec<SymType> = toks.iter().map(|t| t.ty).collect();
        assert_eq!(
            kinds,
            [
                SymType::OpenP,
                SymType::Ident,
                SymType::Num,
                SymType::Num,
                SymType::Num,
                SymType::CloseP
            ]
        );
        assert_eq!(toks[2].val, -42);
        assert_eq!(toks[3].val, 0x2f);
        assert_eq!(toks[4].val, 5);
    }

    #[test]
    fn comments_run_to_end_of_line() {
        let toks = lex_all("alpha ; the rest is noise (\nbeta");
        assert_eq!(toks.len(), 2);
        assert_eq!(toks[0].text, "alpha");
        assert_eq!(toks[1].text, "beta");
    }

    #[test]
    fn strings_fold_whitespace_and_escape() {
        let toks = lex_all("\"a_b  c\\64\"");
        assert_eq!(toks[0].ty, SymType::Str);
        assert_eq!(toks[0].text, "a b cd");
    }

    #[test]
    fn brace_strings_close_on_brace() {
        let toks = lex_all("{hello there}");
        assert_eq!(toks[0].ty, SymType::Str);
        assert_eq!(toks[0].text, "hello there");
    }

    #[test]
    fn strings_continue_across_lines() {
        let toks = lex_all("\"one\n  two\"");
        assert_eq!(toks[0].text, "one two");
    }

    #[test]
    fn char_constants() {
        let toks = lex_all("`a `^m `#1");
        assert_eq!(toks[0].val, 'a' as i32);
        assert_eq!(toks[1].val, 13);
        assert_eq!(toks[2].val, 59 << 8);
    }

    #[test]
    fn conditional_compilation_skips_lines() {
        let toks = lex_all("#if 0\nhidden\n#else\nshown\n#endif\n");
        assert_eq!(toks.len(), 1);
        assert_eq!(toks[0].text, "shown");
    }

    #[test]
    fn nested_conditionals() {
        let toks = lex_all("#if 1\na\n#if 0\nb\n#endif\nc\n#endif\n");
        let names: Vec<&str> = toks.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(names, ["a", "c"]);
    }

    #[test]
    fn const_expr_forms() {
        let syms = SymTbls::new();
        assert_eq!(eval_const_line("(+ 1 2 3)", &syms), 6);
        assert_eq!(eval_const_line("(== 4 (* 2 2))", &syms), 1);
        assert_eq!(eval_const_line("(and 1 0)", &syms), 0);
        assert_eq!(eval_const_line("$10", &syms), 16);
    }

    #[test]
    fn define_replay() {
        let mut syms = SymTbls::new();
        let id = syms.install_global("WIDTH", SymType::Define);
        syms.get_mut(id).payload = Payload::Text("320".to_string());

        let mut diags = DiagnosticEngine::new(false);
        let mut lex = Lexer::new();
        lex.input.push_file_text("t.sc", "WIDTH");
        assert!(lex.new_token(&syms, &mut diags).unwrap());
        assert_eq!(lex.tok.ty, SymType::Num);
        assert_eq!(lex.tok.val, 320);
    }

    #[test]
    fn get_rest_stops_at_unmatched_close() {
        let syms = SymTbls::new();
        let mut diags = DiagnosticEngine::new(false);
        let mut lex = Lexer::new();
        lex.input.push_file_text("t.sc", "(a (b c)) tail)");
        // Consume "(": the rest of the define body runs to the unmatched
        // close paren.
        lex.next_token(&syms, &mut diags).unwrap();
        lex.get_rest(false, &syms, &mut diags).unwrap();
        assert_eq!(lex.tok.text, "a (b c)".to_string());
    }
}

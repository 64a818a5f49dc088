//! Kernel source analysis
//!
//! Extracts kernel entry points, their parameter lists and the number of
//! index-space dimensions each kernel reads, without involving any driver.
//! The result drives argument validation on every backend, so the OpenCL
//! driver and the host reference driver agree on arity and slot types.
//!
//! Object-like `#define`s are expanded and top-level scalar `typedef`s are
//! resolved; anything else the analyser cannot size is kept as an opaque
//! by-value slot.
//!
//! Syntax problems are reported as compiler-style diagnostics
//! (`line:col: error: message`) which become the build log of a failed build.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Scalar types a kernel parameter may carry by value or point at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ScalarType {
    Char,
    UChar,
    Short,
    UShort,
    Half,
    Int,
    UInt,
    Float,
    Long,
    ULong,
    Double,
    SizeT,
}

impl ScalarType {
    /// Size in bytes on the device
    pub const fn size(self) -> usize {
        match self {
            ScalarType::Char | ScalarType::UChar => 1,
            ScalarType::Short | ScalarType::UShort | ScalarType::Half => 2,
            ScalarType::Int | ScalarType::UInt | ScalarType::Float => 4,
            ScalarType::Long | ScalarType::ULong | ScalarType::Double | ScalarType::SizeT => 8,
        }
    }

    /// Whether this is a floating-point type
    pub const fn is_float(self) -> bool {
        matches!(self, ScalarType::Half | ScalarType::Float | ScalarType::Double)
    }

    /// Kernel-language spelling
    pub const fn name(self) -> &'static str {
        match self {
            ScalarType::Char => "char",
            ScalarType::UChar => "uchar",
            ScalarType::Short => "short",
            ScalarType::UShort => "ushort",
            ScalarType::Half => "half",
            ScalarType::Int => "int",
            ScalarType::UInt => "uint",
            ScalarType::Float => "float",
            ScalarType::Long => "long",
            ScalarType::ULong => "ulong",
            ScalarType::Double => "double",
            ScalarType::SizeT => "size_t",
        }
    }

    pub(crate) fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "char" => ScalarType::Char,
            "uchar" => ScalarType::UChar,
            "short" => ScalarType::Short,
            "ushort" => ScalarType::UShort,
            "half" => ScalarType::Half,
            "int" => ScalarType::Int,
            "uint" => ScalarType::UInt,
            "float" => ScalarType::Float,
            "long" => ScalarType::Long,
            "ulong" => ScalarType::ULong,
            "double" => ScalarType::Double,
            "size_t" => ScalarType::SizeT,
            _ => return None,
        })
    }

    fn unsigned_of(name: &str) -> Option<Self> {
        Some(match name {
            "char" => ScalarType::UChar,
            "short" => ScalarType::UShort,
            "int" => ScalarType::UInt,
            "long" => ScalarType::ULong,
            _ => return None,
        })
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Address space of a pointer parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AddressSpace {
    Global,
    Constant,
    Local,
    Private,
}

/// What a kernel parameter slot accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParamKind {
    /// Pointer into device memory; `element` is `None` for vector or
    /// user-defined element types
    Buffer {
        address_space: AddressSpace,
        element: Option<ScalarType>,
    },
    /// Value passed directly
    Scalar(ScalarType),
    /// By-value type the analyser cannot size (vector, struct, unresolved
    /// typedef); any scalar is accepted and the driver checks it
    Opaque,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKind::Buffer { element: Some(ty), .. } => write!(f, "buffer of {ty}"),
            ParamKind::Buffer { element: None, .. } => write!(f, "buffer"),
            ParamKind::Scalar(ty) => write!(f, "{ty}"),
            ParamKind::Opaque => write!(f, "value"),
        }
    }
}

/// One declared kernel parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelParam {
    pub name: String,
    pub kind: ParamKind,
}

/// Entry point signature recovered from source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelSignature {
    pub name: String,
    pub params: Vec<KernelParam>,
    /// Number of index-space dimensions the body reads (1..=3); 0 when the
    /// signature came from the driver and launches are not checked
    pub dimensions: usize,
}

impl KernelSignature {
    /// Number of argument slots
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

/// A located source problem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDiagnostic {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl fmt::Display for SourceDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: error: {}", self.line, self.column, self.message)
    }
}

/// All diagnostics produced for one source text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics(pub Vec<SourceDiagnostic>);

impl Diagnostics {
    fn push(&mut self, line: usize, column: usize, message: impl Into<String>) {
        self.0.push(SourceDiagnostic {
            line,
            column,
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Render as a build log, one diagnostic per line
    pub fn to_log(&self) -> String {
        self.0.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n")
    }
}

/// Work-item dimensions OpenCL defines; higher indices are valid and yield
/// neutral values
const MAX_DIMENSIONS: usize = 3;

const INDEX_QUERIES: &[&str] = &[
    "get_global_id",
    "get_global_size",
    "get_local_id",
    "get_local_size",
    "get_group_id",
    "get_num_groups",
    "get_global_offset",
];

// ================================================================================================
// Tokenizer
// ================================================================================================

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Number(String),
    Punct(char),
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    line: usize,
    column: usize,
}

impl Token {
    fn ident(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Ident(s) => Some(s),
            _ => None,
        }
    }

    fn is_punct(&self, c: char) -> bool {
        self.kind == TokenKind::Punct(c)
    }
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
    at_line_start: bool,
    /// Object-like macros, already expanded
    macros: HashMap<String, Vec<TokenKind>>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
            at_line_start: true,
            macros: HashMap::new(),
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
            self.at_line_start = true;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn peek_second(&self) -> Option<char> {
        let mut it = self.chars.clone();
        it.next();
        it.next()
    }

    fn take_while(&mut self, mut keep: impl FnMut(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if !keep(c) {
                break;
            }
            out.push(c);
            self.bump();
        }
        out
    }

    /// Consume a preprocessor line, honouring backslash continuations
    fn directive(&mut self) -> String {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
            if c == '\\' && self.peek() == Some('\n') {
                self.bump();
                text.push(' ');
                continue;
            }
            text.push(c);
        }
        text
    }

    /// Record `#define NAME body`; function-like macros stay unexpanded
    fn define(&mut self, rest: &str) {
        let rest = rest.trim_start();
        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        let (name, body) = rest.split_at(end);
        if name.is_empty() || body.starts_with('(') {
            return;
        }

        let mut body_lexer = Lexer::new(body);
        body_lexer.at_line_start = false;
        body_lexer.macros = self.macros.clone();
        let expansion = body_lexer
            .tokenize(&mut Diagnostics::default())
            .into_iter()
            .map(|token| token.kind)
            .collect();
        self.macros.insert(name.to_string(), expansion);
    }

    fn tokenize(mut self, diagnostics: &mut Diagnostics) -> Vec<Token> {
        let mut tokens = Vec::new();

        while let Some(c) = self.peek() {
            let (line, column) = (self.line, self.column);

            if c.is_whitespace() {
                self.bump();
                continue;
            }

            if c == '#' && self.at_line_start {
                self.bump();
                let text = self.directive();
                let text = text.trim();
                let (directive, rest) = text.split_at(text.find(char::is_whitespace).unwrap_or(text.len()));
                match directive {
                    "error" => diagnostics.push(line, column, format!("#error{rest}")),
                    "define" => self.define(rest),
                    "undef" => {
                        self.macros.remove(rest.trim());
                    }
                    _ => {}
                }
                continue;
            }
            self.at_line_start = false;

            if c == '/' && self.peek_second() == Some('/') {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.bump();
                }
                continue;
            }

            if c == '/' && self.peek_second() == Some('*') {
                self.bump();
                self.bump();
                let mut closed = false;
                while let Some(c) = self.bump() {
                    if c == '*' && self.peek() == Some('/') {
                        self.bump();
                        closed = true;
                        break;
                    }
                }
                if !closed {
                    diagnostics.push(line, column, "unterminated comment");
                }
                // a comment never starts a directive line
                self.at_line_start = false;
                continue;
            }

            if c == '"' || c == '\'' {
                self.bump();
                let mut closed = false;
                while let Some(ch) = self.bump() {
                    if ch == '\\' {
                        self.bump();
                    } else if ch == c {
                        closed = true;
                        break;
                    } else if ch == '\n' {
                        break;
                    }
                }
                if !closed {
                    diagnostics.push(line, column, "unterminated literal");
                }
                continue;
            }

            let kind = if c.is_ascii_alphabetic() || c == '_' {
                let word = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_');
                if let Some(expansion) = self.macros.get(&word) {
                    tokens.extend(expansion.iter().map(|kind| Token {
                        kind: kind.clone(),
                        line,
                        column,
                    }));
                    continue;
                }
                TokenKind::Ident(word)
            } else if c.is_ascii_digit() {
                TokenKind::Number(self.take_while(|c| c.is_ascii_alphanumeric() || c == '.'))
            } else {
                self.bump();
                TokenKind::Punct(c)
            };
            tokens.push(Token { kind, line, column });
        }

        tokens
    }
}

fn check_balance(tokens: &[Token], diagnostics: &mut Diagnostics) {
    let mut stack: Vec<&Token> = Vec::new();

    for token in tokens {
        let TokenKind::Punct(c) = token.kind else {
            continue;
        };
        match c {
            '(' | '[' | '{' => stack.push(token),
            ')' | ']' | '}' => {
                let open = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some(top) if top.is_punct(open) => {}
                    Some(top) => {
                        diagnostics.push(token.line, token.column, format!("unexpected '{c}'"));
                        stack.push(top);
                    }
                    None => diagnostics.push(token.line, token.column, format!("unexpected '{c}'")),
                }
            }
            _ => {}
        }
    }

    for open in stack {
        let expected = match open.kind {
            TokenKind::Punct('(') => ')',
            TokenKind::Punct('[') => ']',
            _ => '}',
        };
        diagnostics.push(
            open.line,
            open.column,
            format!("expected '{expected}' to match this '{}'", open_char(open)),
        );
    }
}

fn open_char(token: &Token) -> char {
    match token.kind {
        TokenKind::Punct(c) => c,
        _ => '?',
    }
}

/// Index of the token closing the bracket opened at `open`
fn matching_close(tokens: &[Token], open: usize) -> Option<usize> {
    let (o, c) = match tokens.get(open)?.kind {
        TokenKind::Punct('(') => ('(', ')'),
        TokenKind::Punct('{') => ('{', '}'),
        TokenKind::Punct('[') => ('[', ']'),
        _ => return None,
    };
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().skip(open) {
        if token.is_punct(o) {
            depth += 1;
        } else if token.is_punct(c) {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

// ================================================================================================
// Kernel extraction
// ================================================================================================

fn is_kernel_qualifier(token: &Token) -> bool {
    matches!(token.ident(), Some("__kernel" | "kernel"))
}

/// Skip `__attribute__((...))` groups starting at `i`
fn skip_attributes(tokens: &[Token], mut i: usize) -> usize {
    while tokens.get(i).and_then(Token::ident) == Some("__attribute__") {
        match matching_close(tokens, i + 1) {
            Some(close) => i = close + 1,
            None => return tokens.len(),
        }
    }
    i
}

/// Scalar typedef names declared at file scope
type Aliases = HashMap<String, ScalarType>;

fn is_qualifier(word: &str) -> bool {
    matches!(
        word,
        "const"
            | "volatile"
            | "restrict"
            | "__restrict"
            | "__read_only"
            | "__write_only"
            | "read_only"
            | "write_only"
            | "signed"
    )
}

fn resolve_scalar(unsigned: bool, type_name: Option<&str>, aliases: &Aliases) -> Option<ScalarType> {
    match (unsigned, type_name) {
        (true, None) => Some(ScalarType::UInt),
        (true, Some(t)) => ScalarType::unsigned_of(t),
        (false, Some(t)) => ScalarType::from_name(t).or_else(|| aliases.get(t).copied()),
        (false, None) => None,
    }
}

/// Collect `typedef <scalar> NAME;` declarations outside any braces
fn collect_typedefs(tokens: &[Token]) -> Aliases {
    let mut aliases = Aliases::new();
    let mut depth = 0usize;
    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];
        match token.kind {
            TokenKind::Punct('{') => depth += 1,
            TokenKind::Punct('}') => depth = depth.saturating_sub(1),
            _ => {}
        }
        if depth > 0 || token.ident() != Some("typedef") {
            i += 1;
            continue;
        }

        let Some(end) = tokens[i..].iter().position(|t| t.is_punct(';')).map(|p| i + p) else {
            break;
        };
        // struct bodies, pointers and arrays are not scalar aliases
        let words: Option<Vec<&str>> = tokens[i + 1..end].iter().map(Token::ident).collect();
        if let Some((name, type_words)) = words.as_deref().and_then(<[&str]>::split_last) {
            let unsigned = type_words.contains(&"unsigned");
            let type_name = type_words
                .iter()
                .rev()
                .find(|w| !is_qualifier(w) && **w != "unsigned")
                .copied();
            if let Some(ty) = resolve_scalar(unsigned, type_name, &aliases) {
                aliases.insert((*name).to_string(), ty);
            }
        }
        i = end + 1;
    }
    aliases
}

fn parse_param(tokens: &[Token], kernel: &str, aliases: &Aliases, diagnostics: &mut Diagnostics) -> Option<KernelParam> {
    let first = tokens.first()?;
    let mut address_space = None;
    let mut unsigned = false;
    let mut type_words: Vec<&str> = Vec::new();
    let mut pointer = false;

    for token in tokens {
        match &token.kind {
            TokenKind::Punct('*') | TokenKind::Punct('[') => pointer = true,
            TokenKind::Ident(word) => match word.as_str() {
                "__global" | "global" => address_space = Some(AddressSpace::Global),
                "__constant" | "constant" => address_space = Some(AddressSpace::Constant),
                "__local" | "local" => address_space = Some(AddressSpace::Local),
                "__private" | "private" => address_space = Some(AddressSpace::Private),
                "unsigned" => unsigned = true,
                word if is_qualifier(word) => {}
                other => type_words.push(other),
            },
            _ => {}
        }
    }

    // the last identifier is the parameter name
    let Some(name) = type_words.pop() else {
        diagnostics.push(first.line, first.column, format!("unnamed parameter in kernel '{kernel}'"));
        return None;
    };

    let type_name = type_words.last().copied();
    let scalar = resolve_scalar(unsigned, type_name, aliases);

    let kind = if pointer {
        match address_space {
            Some(space @ (AddressSpace::Global | AddressSpace::Constant | AddressSpace::Local)) => ParamKind::Buffer {
                address_space: space,
                element: scalar,
            },
            _ => {
                diagnostics.push(
                    first.line,
                    first.column,
                    format!("pointer parameter '{name}' of kernel '{kernel}' must be __global, __constant or __local"),
                );
                return None;
            }
        }
    } else {
        match (scalar, type_name) {
            (Some(ty), _) => ParamKind::Scalar(ty),
            (None, Some(_)) => ParamKind::Opaque,
            (None, None) => {
                diagnostics.push(
                    first.line,
                    first.column,
                    format!("parameter '{name}' of kernel '{kernel}' has no type"),
                );
                return None;
            }
        }
    };

    Some(KernelParam {
        name: name.to_string(),
        kind,
    })
}

fn body_dimensions(tokens: &[Token]) -> usize {
    let mut dims = 1;
    for window in tokens.windows(4) {
        let [call, open, arg, close] = window else {
            continue;
        };
        let Some(name) = call.ident() else {
            continue;
        };
        if !INDEX_QUERIES.contains(&name) || !open.is_punct('(') || !close.is_punct(')') {
            continue;
        }
        let TokenKind::Number(text) = &arg.kind else {
            continue;
        };
        let digits = text.trim_end_matches(['u', 'U', 'l', 'L']);
        if let Ok(index) = digits.parse::<usize>() {
            if index < MAX_DIMENSIONS {
                dims = dims.max(index + 1);
            }
        }
    }
    dims
}

fn parse_kernel(
    tokens: &[Token],
    start: usize,
    aliases: &Aliases,
    diagnostics: &mut Diagnostics,
) -> (Option<KernelSignature>, usize) {
    let qualifier = &tokens[start];
    let mut i = skip_attributes(tokens, start + 1);

    match tokens.get(i).and_then(Token::ident) {
        Some("void") => i += 1,
        _ => {
            diagnostics.push(qualifier.line, qualifier.column, "kernel function must return void");
            return (None, start + 1);
        }
    }

    let Some(name_token) = tokens.get(i) else {
        diagnostics.push(qualifier.line, qualifier.column, "expected kernel name");
        return (None, tokens.len());
    };
    let Some(name) = name_token.ident().map(str::to_string) else {
        diagnostics.push(name_token.line, name_token.column, "expected kernel name");
        return (None, i + 1);
    };
    i += 1;

    let Some(params_close) = tokens.get(i).filter(|t| t.is_punct('(')).and_then(|_| matching_close(tokens, i)) else {
        diagnostics.push(name_token.line, name_token.column, format!("expected '(' after kernel '{name}'"));
        return (None, i);
    };

    let mut params = Vec::new();
    let inner = &tokens[i + 1..params_close];
    let is_void_list = inner.len() == 1 && inner[0].ident() == Some("void");
    if !inner.is_empty() && !is_void_list {
        let mut depth = 0usize;
        let mut begin = 0;
        for (j, token) in inner.iter().enumerate() {
            match token.kind {
                TokenKind::Punct('(' | '[') => depth += 1,
                TokenKind::Punct(')' | ']') => depth = depth.saturating_sub(1),
                TokenKind::Punct(',') if depth == 0 => {
                    if let Some(p) = parse_param(&inner[begin..j], &name, aliases, diagnostics) {
                        params.push(p);
                    }
                    begin = j + 1;
                }
                _ => {}
            }
        }
        if let Some(p) = parse_param(&inner[begin..], &name, aliases, diagnostics) {
            params.push(p);
        }
    }

    let mut i = skip_attributes(tokens, params_close + 1);
    let Some(body_close) = tokens.get(i).filter(|t| t.is_punct('{')).and_then(|_| matching_close(tokens, i)) else {
        let at = tokens.get(i).unwrap_or(name_token);
        diagnostics.push(at.line, at.column, format!("expected '{{' to begin body of kernel '{name}'"));
        return (None, i);
    };

    let dimensions = body_dimensions(&tokens[i + 1..body_close]);
    i = body_close + 1;

    (
        Some(KernelSignature {
            name,
            params,
            dimensions,
        }),
        i,
    )
}

/// Analyse kernel source text.
///
/// Returns every `__kernel` entry point in declaration order, or the full
/// set of diagnostics when the text is malformed or declares no kernels.
pub fn parse_kernels(source: &str) -> Result<Vec<KernelSignature>, Diagnostics> {
    let mut diagnostics = Diagnostics::default();
    let tokens = Lexer::new(source).tokenize(&mut diagnostics);
    check_balance(&tokens, &mut diagnostics);
    if !diagnostics.is_empty() {
        return Err(diagnostics);
    }

    let aliases = collect_typedefs(&tokens);
    let mut kernels: Vec<KernelSignature> = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];
        if depth == 0 && is_kernel_qualifier(token) {
            let (kernel, next) = parse_kernel(&tokens, i, &aliases, &mut diagnostics);
            if let Some(kernel) = kernel {
                if kernels.iter().any(|k| k.name == kernel.name) {
                    diagnostics.push(token.line, token.column, format!("redefinition of kernel '{}'", kernel.name));
                } else {
                    kernels.push(kernel);
                }
            }
            i = next.max(i + 1);
            continue;
        }
        match token.kind {
            TokenKind::Punct('{') => depth += 1,
            TokenKind::Punct('}') => depth = depth.saturating_sub(1),
            _ => {}
        }
        i += 1;
    }

    if kernels.is_empty() && diagnostics.is_empty() {
        diagnostics.push(1, 1, "no kernel entry points found in program source");
    }
    if diagnostics.is_empty() {
        Ok(kernels)
    } else {
        Err(diagnostics)
    }
}

/// Parameter as a driver's argument query describes it: the address
/// qualifier and the type name (`"float*"`, `"uint"`, `"float4"`)
pub fn reported_param(name: impl Into<String>, address_space: AddressSpace, type_name: &str) -> KernelParam {
    let spelled = type_name.trim();
    let pointer = spelled.ends_with('*');
    let base = spelled.trim_end_matches('*').trim();
    let base = base.strip_prefix("const ").unwrap_or(base).trim();
    let scalar = match base.strip_prefix("unsigned ") {
        Some(rest) => ScalarType::unsigned_of(rest.trim()),
        None => ScalarType::from_name(base),
    };

    let kind = match (pointer, address_space) {
        (false, AddressSpace::Private) => scalar.map_or(ParamKind::Opaque, ParamKind::Scalar),
        (_, AddressSpace::Private) => ParamKind::Buffer {
            address_space: AddressSpace::Global,
            element: scalar,
        },
        (_, space) => ParamKind::Buffer {
            address_space: space,
            element: scalar,
        },
    };
    KernelParam {
        name: name.into(),
        kind,
    }
}

use regex::Regex;
use utils::tool_signature::ActionSignature;

/// A parsed rule pattern: `Tool`, `Tool(arg-glob)`, or `*`.
///
/// A bare tool name matches every call to that tool. Inside the parentheses
/// `*` matches any run of characters and `\` escapes the next character;
/// everything else is literal.
#[derive(Debug, Clone)]
pub struct RulePattern {
    raw: String,
    tool: String,
    argument: Option<Regex>,
}

impl RulePattern {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("pattern is empty".to_string());
        }
        let (tool, argument) = match raw.find('(') {
            Some(open) => {
                if !raw.ends_with(')') {
                    return Err(format!("pattern '{raw}' has an unclosed argument"));
                }
                (&raw[..open], Some(&raw[open + 1..raw.len() - 1]))
            }
            None => (raw, None),
        };
        let tool = tool.trim();
        if tool.is_empty() {
            return Err(format!("pattern '{raw}' has no tool name"));
        }
        let argument = argument
            .map(|glob| glob_to_regex(glob.trim()))
            .transpose()
            .map_err(|e| format!("pattern '{raw}': {e}"))?;
        Ok(Self {
            raw: raw.to_string(),
            tool: tool.to_string(),
            argument,
        })
    }

    /// A pattern matching exactly `signature` and nothing else. Any `*` or `\`
    /// in the argument is escaped so it matches only itself.
    pub fn exact(signature: &ActionSignature) -> Result<Self, String> {
        Self::parse(&format!(
            "{}({})",
            signature.tool_name,
            escape_glob(&signature.argument)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, signature: &ActionSignature) -> bool {
        if self.tool != "*" && self.tool != signature.tool_name {
            return false;
        }
        match &self.argument {
            None => true,
            Some(re) => re.is_match(&signature.argument),
        }
    }
}

pub fn escape_glob(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let mut body = String::from("^");
    let mut literal = String::new();
    let mut chars = glob.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => literal.push(chars.next().unwrap_or('\\')),
            '*' => {
                body.push_str(&regex::escape(&literal));
                literal.clear();
                body.push_str(".*");
            }
            _ => literal.push(c),
        }
    }
    body.push_str(&regex::escape(&literal));
    body.push('$');
    Regex::new(&body)
}

//! `$flow.`/`$ctx.`/`$env.` variable substitution.
//!
//! Grounded verbatim on `core_runtime/kernel_variable_resolver.py`:
//! `$flow.key` and `$ctx.key` are the same namespace (both walk the single
//! context map with dotted nested access) — the prefix is purely a
//! readability convention callers use, not two different stores. `$env.KEY`
//! reads the process environment, joining any embedded dots back into one
//! key. A string that is *exactly* one variable reference preserves the
//! resolved value's type (so a reference can resolve to a whole object);
//! a string with an embedded reference is substituted via string
//! conversion. An unresolved reference is left exactly as written, the
//! same "fail open to the literal token" behavior as the source, rather
//! than becoming an error or `null` — callers who need missing-variable
//! diagnostics should inspect the returned string for a stray `$` token.
//! [`MAX_DEPTH`] guards both the recursive descent into objects/arrays and
//! a reference whose resolved value is itself a further reference.

use serde_json::Value;

/// Recursion ceiling for nested object/array walks and chained
/// whole-token re-resolution.
pub const MAX_DEPTH: usize = 20;

/// Resolves `$flow.`/`$ctx.`/`$env.` references against a single context
/// map.
pub struct VariableResolver<'a> {
    ctx: &'a Value,
}

impl<'a> VariableResolver<'a> {
    pub fn new(ctx: &'a Value) -> Self {
        Self { ctx }
    }

    /// Resolve every reference reachable from `template`, recursing into
    /// objects and arrays. Past [`MAX_DEPTH`] the value is returned
    /// unresolved, matching the source's depth-exceeded fallback.
    pub fn resolve(&self, template: &Value) -> Value {
        self.resolve_at(template, 0)
    }

    fn resolve_at(&self, template: &Value, depth: usize) -> Value {
        if depth > MAX_DEPTH {
            return template.clone();
        }
        match template {
            Value::String(s) => self.resolve_string(s, depth),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve_at(v, depth + 1));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_at(v, depth + 1)).collect()),
            other => other.clone(),
        }
    }

    fn resolve_string(&self, s: &str, depth: usize) -> Value {
        let stripped = s.trim();
        if let Some(span) = full_match_token(stripped) {
            let resolved = self.lookup(&span.0, &span.1);
            if let Value::String(inner) = &resolved {
                if depth < MAX_DEPTH {
                    return self.resolve_at(&Value::String(inner.clone()), depth + 1);
                }
            }
            return resolved;
        }

        let tokens = scan_tokens(s);
        if tokens.is_empty() {
            return Value::String(s.to_string());
        }
        let mut out = String::with_capacity(s.len());
        let mut cursor = 0;
        for (start, end, ns, path) in &tokens {
            out.push_str(&s[cursor..*start]);
            let resolved = self.lookup(ns, path);
            out.push_str(&stringify(&resolved));
            cursor = *end;
        }
        out.push_str(&s[cursor..]);
        Value::String(out)
    }

    /// Look up a single `ns.path` reference. Returns the literal
    /// `$ns.path` token unchanged when the path can't be resolved,
    /// mirroring the source's fail-open behavior.
    fn lookup(&self, ns: &str, path: &str) -> Value {
        let token = format!("${ns}.{path}");
        if ns == "env" {
            return std::env::var(path).map(Value::String).unwrap_or(Value::String(token));
        }
        let segments: Vec<&str> = path.split('.').collect();
        let mut current = self.ctx;
        for seg in &segments {
            match current.get(*seg) {
                Some(v) => current = v,
                None => return Value::String(token),
            }
        }
        current.clone()
    }
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// If `s` is, in its entirety, a single `$ns.path` token, return `(ns, path)`.
fn full_match_token(s: &str) -> Option<(String, String)> {
    let tokens = scan_tokens(s);
    if tokens.len() == 1 && tokens[0].0 == 0 && tokens[0].1 == s.len() {
        Some((tokens[0].2.clone(), tokens[0].3.clone()))
    } else {
        None
    }
}

/// Scan `s` for `$flow.`/`$ctx.`/`$env.` tokens, returning
/// `(start, end, namespace, dotted_path)` in order of appearance.
fn scan_tokens(s: &str) -> Vec<(usize, usize, String, String)> {
    let mut out = Vec::new();
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            if let Some((ns, consumed)) = match_namespace(&s[i + 1..]) {
                let path_start = i + 1 + consumed;
                let path_end = scan_path(s, path_start);
                if path_end > path_start {
                    out.push((i, path_end, ns.to_string(), s[path_start..path_end].to_string()));
                    i = path_end;
                    continue;
                }
            }
        }
        i += 1;
    }
    out
}

fn match_namespace(rest: &str) -> Option<(&'static str, usize)> {
    for (prefix, ns) in [("flow.", "flow"), ("ctx.", "ctx"), ("env.", "env")] {
        if rest.starts_with(prefix) {
            return Some((ns, prefix.len()));
        }
    }
    None
}

fn scan_path(s: &str, start: usize) -> usize {
    let mut end = start;
    for c in s[start..].chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
            end += c.len_utf8();
        } else {
            break;
        }
    }
    while end > start && s.as_bytes()[end - 1] == b'.' {
        end -= 1;
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn whole_token_preserves_underlying_type() {
        let ctx = json!({"outputs": {"count": 5}});
        let r = VariableResolver::new(&ctx);
        assert_eq!(r.resolve(&json!("$flow.outputs.count")), json!(5));
    }

    #[test]
    fn flow_and_ctx_prefixes_share_the_same_map() {
        let ctx = json!({"shared": "value"});
        let r = VariableResolver::new(&ctx);
        assert_eq!(r.resolve(&json!("$flow.shared")), json!("value"));
        assert_eq!(r.resolve(&json!("$ctx.shared")), json!("value"));
    }

    #[test]
    fn interpolated_token_stringifies() {
        let ctx = json!({"outputs": {"name": "alice"}});
        let r = VariableResolver::new(&ctx);
        assert_eq!(r.resolve(&json!("hello $flow.outputs.name!")), json!("hello alice!"));
    }

    #[test]
    fn env_namespace_reads_process_environment() {
        std::env::set_var("RUMI_KERNEL_TEST_VAR", "set");
        let ctx = json!({});
        let r = VariableResolver::new(&ctx);
        assert_eq!(r.resolve(&json!("$env.RUMI_KERNEL_TEST_VAR")), json!("set"));
        std::env::remove_var("RUMI_KERNEL_TEST_VAR");
    }

    #[test]
    fn unresolved_reference_passes_through_literally() {
        let ctx = json!({});
        let r = VariableResolver::new(&ctx);
        assert_eq!(r.resolve(&json!("$flow.does.not.exist")), json!("$flow.does.not.exist"));
    }

    #[test]
    fn recurses_into_nested_objects_and_arrays() {
        let ctx = json!({"x": 1});
        let r = VariableResolver::new(&ctx);
        let template = json!({"a": ["$flow.x", {"b": "$ctx.x"}]});
        let resolved = r.resolve(&template);
        assert_eq!(resolved["a"][0], json!(1));
        assert_eq!(resolved["a"][1]["b"], json!(1));
    }

    #[test]
    fn self_referential_chain_terminates_at_depth_guard() {
        let ctx = json!({"a": "$flow.a"});
        let r = VariableResolver::new(&ctx);
        // Each whole-token resolution re-enters resolve_at one level
        // deeper; depth guard returns the last resolved value unexpanded
        // instead of looping forever.
        let _ = r.resolve(&json!("$flow.a"));
    }
}

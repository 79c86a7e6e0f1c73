//! Environment template substitution.
//!
//! Provider `env` entries are `KEY=VALUE` strings whose values may contain
//! two token forms:
//!
//! | Token | Resolves to |
//! |-------|-------------|
//! | `$(cluster-name)` | Instance id, e.g. `kind-1` |
//! | `$(uuid)` | A v4 UUID, fixed for the lifetime of the instance |
//! | `$(tempdir)` | The instance's temporary directory |
//! | `$(NAME)` / `${NAME}` | A variable defined by an earlier entry, else the process environment |
//!
//! Substitution is a single left-to-right pass: substituted text is never
//! re-scanned. A `$` not followed by `(` or `{` is kept literally. Tokens
//! that cannot be resolved are errors.

use std::path::PathBuf;

/// Error resolving an environment template.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("env entry {0:?} is not of the form KEY=VALUE")]
    MissingSeparator(String),

    #[error("unterminated token in env entry {0:?}")]
    Unterminated(String),

    #[error("unresolved variable {name} in env entry {entry:?}")]
    Unresolved { name: String, entry: String },
}

/// Built-in token values of one instance.
#[derive(Debug, Clone)]
pub struct TemplateContext {
    pub cluster_name: String,
    pub uuid: String,
    pub tempdir: PathBuf,
}

impl TemplateContext {
    /// Creates a context with a freshly generated uuid.
    pub fn new(cluster_name: impl Into<String>, tempdir: impl Into<PathBuf>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            uuid: uuid::Uuid::new_v4().to_string(),
            tempdir: tempdir.into(),
        }
    }

    fn builtin(&self, name: &str) -> Option<String> {
        match name {
            "cluster-name" => Some(self.cluster_name.clone()),
            "uuid" => Some(self.uuid.clone()),
            "tempdir" => Some(self.tempdir.display().to_string()),
            _ => None,
        }
    }
}

/// Resolves `entries` in order against the process environment.
pub fn resolve_env(
    entries: &[String],
    ctx: &TemplateContext,
) -> Result<Vec<(String, String)>, TemplateError> {
    resolve_env_with(entries, ctx, |name| std::env::var(name).ok())
}

/// Resolves `entries` in order, looking up non built-in names first among
/// already resolved entries and then through `lookup`.
pub fn resolve_env_with<F>(
    entries: &[String],
    ctx: &TemplateContext,
    lookup: F,
) -> Result<Vec<(String, String)>, TemplateError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut resolved: Vec<(String, String)> = Vec::with_capacity(entries.len());

    for entry in entries {
        let (key, template) = entry
            .split_once('=')
            .filter(|(key, _)| !key.trim().is_empty())
            .ok_or_else(|| TemplateError::MissingSeparator(entry.clone()))?;

        let value = substitute(template, |name| {
            ctx.builtin(name)
                .or_else(|| {
                    resolved
                        .iter()
                        .rev()
                        .find(|(k, _)| k == name)
                        .map(|(_, v)| v.clone())
                })
                .or_else(|| lookup(name))
        })
        .map_err(|err| match err {
            SubstituteError::Unterminated => TemplateError::Unterminated(entry.clone()),
            SubstituteError::Unresolved(name) => TemplateError::Unresolved {
                name,
                entry: entry.clone(),
            },
        })?;

        resolved.push((key.trim().to_string(), value));
    }

    Ok(resolved)
}

enum SubstituteError {
    Unterminated,
    Unresolved(String),
}

fn substitute<F>(template: &str, resolve: F) -> Result<String, SubstituteError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let close = match after.chars().next() {
            Some('(') => ')',
            Some('{') => '}',
            _ => {
                out.push('$');
                rest = after;
                continue;
            }
        };

        let end = after.find(close).ok_or(SubstituteError::Unterminated)?;
        let name = &after[1..end];
        let value = resolve(name).ok_or_else(|| SubstituteError::Unresolved(name.to_string()))?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

//! Simulator configuration tree: load, dotted-path edits, canonical
//! serialization, and content hashing.
//!
//! The simulator consumes a nested TOML document. The tuner only ever
//! mutates it through [`SimConfig::set`] on dotted paths declared by the
//! schema, and always serializes it through the canonical emitter so that
//! the same logical configuration produces byte-identical files. The cache
//! and the run-metadata identity check both key on [`SimConfig::hash16`],
//! which hashes that canonical form.
//!
//! Canonical form: tables emitted with sorted keys, floats always carrying
//! a decimal point, scalars before subtables. Key order in the source file
//! therefore never leaks into the hash.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use toml::Value;

/// One override applied by the frozen baseline scenario at startup.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedOverride {
    pub path: String,
    pub old: Option<toml::Value>,
    pub new: toml::Value,
}

/// A simulator configuration document.
#[derive(Debug, Clone)]
pub struct SimConfig {
    root: Value,
}

impl SimConfig {
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let root: Value = toml::from_str(&text)
            .with_context(|| format!("failed to parse TOML config: {}", path.display()))?;
        Ok(Self { root })
    }

    /// Look up a value by dotted path. Returns `None` when any segment is
    /// absent or a non-table intermediate is hit.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut cur = &self.root;
        for key in path.split('.') {
            cur = cur.as_table()?.get(key)?;
        }
        Some(cur)
    }

    pub fn get_i64(&self, path: &str) -> Option<i64> {
        self.get(path).and_then(Value::as_integer)
    }

    pub fn get_f64(&self, path: &str) -> Option<f64> {
        match self.get(path)? {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(Value::as_bool)
    }

    /// Set a value by dotted path, creating intermediate tables as needed.
    /// Fails if an intermediate segment exists but is not a table.
    pub fn set(&mut self, path: &str, value: Value) -> Result<()> {
        let keys: Vec<&str> = path.split('.').collect();
        let mut cur = self
            .root
            .as_table_mut()
            .context("config root is not a table")?;
        for key in &keys[..keys.len() - 1] {
            let entry = cur
                .entry(key.to_string())
                .or_insert_with(|| Value::Table(Default::default()));
            cur = match entry.as_table_mut() {
                Some(t) => t,
                None => bail!("config path {path} traverses non-table segment {key}"),
            };
        }
        cur.insert(keys[keys.len() - 1].to_string(), value);
        Ok(())
    }

    /// Apply the schema's frozen-scenario overrides so every baseline and
    /// candidate run starts from a comparable world setup. Returns the
    /// changes actually made.
    pub fn apply_overrides(
        &mut self,
        required: &[(String, serde_json::Value)],
    ) -> Result<Vec<AppliedOverride>> {
        let mut applied = Vec::new();
        for (path, expected) in required {
            let new = json_to_toml(expected)
                .with_context(|| format!("unsupported frozen override value at {path}"))?;
            let old = self.get(path).cloned();
            if old.as_ref() != Some(&new) {
                self.set(path, new.clone())?;
                applied.push(AppliedOverride {
                    path: path.clone(),
                    old,
                    new,
                });
            }
        }
        Ok(applied)
    }

    /// Deterministic serialization: sorted keys, stable scalar formatting.
    pub fn canonical_toml(&self) -> String {
        let mut out = String::new();
        emit_table("", self.root.as_table().cloned().unwrap_or_default(), &mut out);
        while out.ends_with('\n') {
            out.pop();
        }
        out.push('\n');
        out
    }

    /// Short content digest used in cache keys and run-metadata identity
    /// checks: sha-256 of the canonical form, truncated to 16 hex digits.
    pub fn hash16(&self) -> String {
        let digest = Sha256::digest(self.canonical_toml().as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        hex[..16].to_string()
    }

    /// Write the canonical form to disk.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(path, self.canonical_toml())
            .with_context(|| format!("failed to write config: {}", path.display()))
    }
}

fn emit_table(prefix: &str, table: toml::map::Map<String, Value>, out: &mut String) {
    let mut scalars: Vec<(String, Value)> = Vec::new();
    let mut subtables: Vec<(String, toml::map::Map<String, Value>)> = Vec::new();
    for (k, v) in table {
        match v {
            Value::Table(t) => subtables.push((k, t)),
            other => scalars.push((k, other)),
        }
    }
    scalars.sort_by(|a, b| a.0.cmp(&b.0));
    subtables.sort_by(|a, b| a.0.cmp(&b.0));

    if !prefix.is_empty() {
        out.push_str(&format!("[{prefix}]\n"));
    }
    for (k, v) in &scalars {
        out.push_str(&format!("{k} = {}\n", format_scalar(v)));
    }
    if !prefix.is_empty() && !(scalars.is_empty() && subtables.is_empty()) {
        out.push('\n');
    }
    for (k, sub) in subtables {
        let child = if prefix.is_empty() {
            k
        } else {
            format!("{prefix}.{k}")
        };
        emit_table(&child, sub, out);
    }
}

fn format_scalar(v: &Value) -> String {
    match v {
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        // Debug formatting keeps the decimal point on round floats, which
        // plain Display drops ("2" is not a valid TOML float).
        Value::Float(f) => format!("{f:?}"),
        Value::String(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(format_scalar).collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Datetime(dt) => dt.to_string(),
        Value::Table(_) => String::new(),
    }
}

/// Convert a JSON scalar/array from the schema document into a TOML value.
pub fn json_to_toml(v: &serde_json::Value) -> Result<Value> {
    Ok(match v {
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else {
                Value::Float(n.as_f64().context("non-finite number")?)
            }
        }
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => {
            let converted: Result<Vec<Value>> = items.iter().map(json_to_toml).collect();
            Value::Array(converted?)
        }
        other => bail!("unsupported value kind: {other}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> SimConfig {
        SimConfig::from_value(toml::from_str(text).unwrap())
    }

    #[test]
    fn test_get_and_set_dotted_paths() {
        let mut cfg = parse("[food]\nbaseFarming = 1.5\n");
        assert_eq!(cfg.get_f64("food.baseFarming"), Some(1.5));
        assert_eq!(cfg.get("food.missing"), None);

        cfg.set("food.baseFarming", Value::Float(2.0)).unwrap();
        assert_eq!(cfg.get_f64("food.baseFarming"), Some(2.0));

        // Intermediate tables are created on demand.
        cfg.set("economy.trade.scale", Value::Integer(3)).unwrap();
        assert_eq!(cfg.get_i64("economy.trade.scale"), Some(3));
    }

    #[test]
    fn test_set_refuses_scalar_intermediate() {
        let mut cfg = parse("[world]\nstartYear = -5000\n");
        assert!(cfg.set("world.startYear.sub", Value::Integer(1)).is_err());
    }

    #[test]
    fn test_canonical_form_is_key_order_independent() {
        let a = parse("[b]\ny = 2\nx = 1\n[a]\nz = 3.0\n");
        let b = parse("[a]\nz = 3.0\n[b]\nx = 1\ny = 2\n");
        assert_eq!(a.canonical_toml(), b.canonical_toml());
        assert_eq!(a.hash16(), b.hash16());
        assert_eq!(a.hash16().len(), 16);
    }

    #[test]
    fn test_hash_changes_with_content() {
        let a = parse("[w]\nv = 1\n");
        let b = parse("[w]\nv = 2\n");
        assert_ne!(a.hash16(), b.hash16());
    }

    #[test]
    fn test_round_floats_stay_floats() {
        let cfg = parse("[w]\nv = 2.0\n");
        let text = cfg.canonical_toml();
        assert!(text.contains("v = 2.0"), "got: {text}");
        // Canonical output must reparse to the same tree.
        let reparsed: Value = toml::from_str(&text).unwrap();
        assert_eq!(reparsed, cfg.root);
    }

    #[test]
    fn test_apply_overrides_reports_changes_only() {
        let mut cfg = parse("[world]\nstartYear = -5000\n");
        let required = vec![
            ("world.startYear".to_string(), serde_json::json!(-5000)),
            ("world.spawnMode".to_string(), serde_json::json!("fixed")),
        ];
        let applied = cfg.apply_overrides(&required).unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].path, "world.spawnMode");
        assert!(applied[0].old.is_none());
        assert_eq!(
            cfg.get("world.spawnMode"),
            Some(&Value::String("fixed".into()))
        );
    }
}

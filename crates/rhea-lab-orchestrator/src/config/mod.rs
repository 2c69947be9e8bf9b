use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

/// The live configuration object for one lab. One instance per
/// `Environment`; always passed by reference, never a process-wide
/// singleton. Checkpoint descriptors are serialized snapshots of
/// `value`.
#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn in_memory(value: Value) -> Self {
        Self {
            path: PathBuf::from("<mem>"),
            value,
        }
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }

        let mut cur = &self.value;
        for seg in parse_keypath(path).ok()? {
            cur = match seg {
                Seg::Key(k) => cur.as_table()?.get(&k)?,
                Seg::Index(i) => {
                    // Mirrors the write-side convention: negative means
                    // slot 0.
                    let idx = if i < 0 { 0 } else { i as usize };
                    cur.as_array()?.get(idx)?
                }
            };
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let owned = v.clone();
        let parsed = owned
            .try_into()
            .map_err(|e| Error::msg(format!("failed to deserialize config at '{}': {e}", path)))?;
        Ok(Some(parsed))
    }

    pub fn bool_path(&self, path: &str) -> bool {
        self.value_path(path)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Keypath mutation with auto-vivification; see [`set_keypath`].
    pub fn set_path(&mut self, path: &str, new: Value) -> Result<()> {
        set_keypath(&mut self.value, path, new)
    }

    pub fn set_bool_path(&mut self, path: &str, v: bool) -> Result<()> {
        self.set_path(path, Value::Boolean(v))
    }

    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(&self.value).unwrap_or_else(|_| format!("{:?}", self.value))
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

pub fn merge(base: &mut Value, overlay: Value) {
    merge_values(base, overlay);
}

fn read_value(path: &Path) -> Result<Value> {
    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value: read_value(path)?,
    })
}

/// Load a base config and deep-merge an overlay file over it, so labs
/// can share a common base definition.
pub fn load_with_overlay(base: &Path, overlay: &Path) -> Result<ConfigDoc> {
    let mut value = read_value(base)?;
    merge_values(&mut value, read_value(overlay)?);
    Ok(ConfigDoc {
        path: overlay.to_path_buf(),
        value,
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Seg {
    Key(String),
    Index(i64),
}

fn parse_keypath(path: &str) -> Result<Vec<Seg>> {
    let path = path.trim();
    if path.is_empty() {
        return Err(Error::msg("empty keypath"));
    }
    let mut out = Vec::new();
    for part in path.split('.') {
        let mut rest = part;
        if let Some(open) = rest.find('[') {
            let key = &rest[..open];
            if !key.is_empty() {
                out.push(Seg::Key(key.to_string()));
            }
            rest = &rest[open..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let Some(close) = stripped.find(']') else {
                    return Err(Error::msg(format!("unclosed index in keypath '{path}'")));
                };
                let idx: i64 = stripped[..close].trim().parse().map_err(|_| {
                    Error::msg(format!("invalid index '{}' in keypath '{path}'", &stripped[..close]))
                })?;
                out.push(Seg::Index(idx));
                rest = &stripped[close + 1..];
            }
            if !rest.is_empty() {
                return Err(Error::msg(format!("malformed segment '{part}' in keypath '{path}'")));
            }
        } else {
            if rest.is_empty() {
                return Err(Error::msg(format!("empty segment in keypath '{path}'")));
            }
            out.push(Seg::Key(rest.to_string()));
        }
    }
    Ok(out)
}

fn filler_for(next: Option<&Seg>) -> Value {
    match next {
        Some(Seg::Index(_)) => Value::Array(Vec::new()),
        _ => Value::Table(toml::value::Table::new()),
    }
}

fn assign(cur: &mut Value, segs: &[Seg], new: Value) -> Result<()> {
    let Some(seg) = segs.first() else {
        *cur = new;
        return Ok(());
    };
    let rest = &segs[1..];

    match seg {
        Seg::Key(k) => {
            if !cur.is_table() {
                *cur = Value::Table(toml::value::Table::new());
            }
            let tbl = cur.as_table_mut().expect("just vivified table");
            let slot = tbl
                .entry(k.clone())
                .or_insert_with(|| filler_for(rest.first()));
            assign(slot, rest, new)
        }
        Seg::Index(i) => {
            if !cur.is_array() {
                *cur = Value::Array(Vec::new());
            }
            let arr = cur.as_array_mut().expect("just vivified array");
            // A negative index is NOT end-relative here: it creates one
            // nesting level (the list slot, if absent) and uses slot 0.
            // Kept exactly as the legacy template patcher behaved.
            let idx = if *i < 0 {
                if arr.is_empty() {
                    arr.push(filler_for(rest.first()));
                }
                0
            } else {
                let want = *i as usize;
                while arr.len() <= want {
                    arr.push(filler_for(rest.first()));
                }
                want
            };
            assign(&mut arr[idx], rest, new)
        }
    }
}

/// Set `path` inside a TOML tree, creating any missing intermediate
/// tables and list slots along the way. Used to patch declarative
/// batch templates and to flip per-stage installed flags.
pub fn set_keypath(root: &mut Value, path: &str, new: Value) -> Result<()> {
    let segs = parse_keypath(path)?;
    assign(root, &segs, new)
}

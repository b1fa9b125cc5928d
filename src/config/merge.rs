//! Cloud-config merging
//!
//! Two kinds of merge live here:
//!
//! - [`deep_merge`]: layering of whole config sources (system config,
//!   datasource, vendor, user). Mappings merge recursively and every other
//!   value from the higher source replaces the lower one.
//! - [`Merger`]: the pluggable chain selected by `merge_how` / `X-Merge-Type`
//!   (`dict(<opts>)+list(<opts>)+str(<opts>)`), applied part by part when
//!   accumulating `#cloud-config` parts.

use crate::CloudInitError;
use serde_yaml::{Mapping, Value};
use tracing::debug;

/// Merge chain used for `#cloud-config` parts that declare none
pub const DEFAULT_PART_MERGE: &str = "dict(replace)+list()+str()";

/// A parsed `name(opt, opt)` merger entry
pub type MergerSpec = (String, Vec<String>);

/// Parse `dict(recurse_array)+list(append)+str()` into merger specs
pub fn parse_merge_how(merge_how: &str) -> Result<Vec<MergerSpec>, CloudInitError> {
    let mut parsed = Vec::new();
    for raw in merge_how.split('+') {
        let name = raw.trim().to_lowercase().replace('-', "_");
        if name.is_empty() {
            continue;
        }
        let (m_name, rest) = name.split_once('(').ok_or_else(|| {
            CloudInitError::Config(format!("Merger identifier '{name}' is not in the right format"))
        })?;
        let opts = rest.strip_suffix(')').ok_or_else(|| {
            CloudInitError::Config(format!("Merger identifier '{name}' is not in the right format"))
        })?;
        let valid_name = m_name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
            && m_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_name {
            return Err(CloudInitError::Config(format!(
                "Merger identifier '{name}' is not in the right format"
            )));
        }
        let opts = opts
            .split(',')
            .map(|o| o.trim().to_lowercase())
            .filter(|o| !o.is_empty())
            .collect();
        parsed.push((m_name.to_string(), opts));
    }
    Ok(parsed)
}

/// Remove and parse a `merge_how` (or `merge_type`) key from a config mapping
///
/// The value may be a string or a list of `{name, settings}` mappings or
/// `[name, opt...]` lists.
pub fn extract_mergers(config: &mut Mapping) -> Result<Vec<MergerSpec>, CloudInitError> {
    let raw = match config.remove("merge_how") {
        Some(v) => v,
        None => match config.remove("merge_type") {
            Some(v) => v,
            None => return Ok(Vec::new()),
        },
    };

    match raw {
        Value::String(s) => parse_merge_how(&s),
        Value::Sequence(items) => {
            let mut parsed = Vec::new();
            for item in items {
                let (name, opts) = match &item {
                    Value::Mapping(m) => {
                        let name = m.get("name").and_then(Value::as_str).unwrap_or_default();
                        let opts: Vec<String> = m
                            .get("settings")
                            .and_then(Value::as_sequence)
                            .map(|s| s.iter().filter_map(Value::as_str).map(String::from).collect())
                            .unwrap_or_default();
                        (name.to_string(), opts)
                    }
                    Value::Sequence(s) => {
                        let mut strs = s.iter().filter_map(Value::as_str).map(String::from);
                        let name = strs.next().unwrap_or_default();
                        (name, strs.collect())
                    }
                    _ => continue,
                };
                let name = name.trim().to_lowercase().replace('-', "_");
                if !name.is_empty() {
                    parsed.push((name, opts.into_iter().map(|o: String| o.to_lowercase()).collect()));
                }
            }
            Ok(parsed)
        }
        Value::Null => Ok(Vec::new()),
        other => Err(CloudInitError::Config(format!(
            "Unsupported merge_how value: {other:?}"
        ))),
    }
}

/// How a mapping merges with a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictMethod {
    /// No method given: every shared key merges through the chain
    Recurse,
    /// Shared keys take the new value
    Replace,
    /// Shared keys keep the old value (mappings still recurse)
    NoReplace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictMerger {
    pub method: DictMethod,
    pub recurse_array: bool,
    pub recurse_str: bool,
    pub allow_delete: bool,
}

impl DictMerger {
    fn new(opts: &[String]) -> Self {
        let has = |o: &str| opts.iter().any(|x| x == o);
        let method = if has("replace") {
            DictMethod::Replace
        } else if has("no_replace") {
            DictMethod::NoReplace
        } else {
            DictMethod::Recurse
        };
        Self {
            method,
            recurse_array: has("recurse_array") || has("recurse_list"),
            recurse_str: has("recurse_str"),
            allow_delete: has("allow_delete"),
        }
    }
}

/// How a sequence merges with a sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMethod {
    Replace,
    Append,
    Prepend,
    NoReplace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListMerger {
    pub method: ListMethod,
    pub recurse_dict: bool,
    pub recurse_array: bool,
    pub recurse_str: bool,
}

impl ListMerger {
    fn new(opts: &[String]) -> Self {
        let has = |o: &str| opts.iter().any(|x| x == o);
        let method = if has("append") {
            ListMethod::Append
        } else if has("prepend") {
            ListMethod::Prepend
        } else if has("no_replace") {
            ListMethod::NoReplace
        } else {
            ListMethod::Replace
        };
        Self {
            method,
            recurse_dict: has("recurse_dict"),
            recurse_array: has("recurse_array") || has("recurse_list"),
            recurse_str: has("recurse_str"),
        }
    }

    fn recurses(&self) -> bool {
        self.recurse_dict || self.recurse_array || self.recurse_str
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrMerger {
    pub append: bool,
}

/// A merger chain built from `merge_how`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merger {
    dict: Option<DictMerger>,
    list: Option<ListMerger>,
    string: Option<StrMerger>,
}

impl Default for Merger {
    fn default() -> Self {
        Self::from_merge_how(DEFAULT_PART_MERGE).unwrap_or(Self {
            dict: None,
            list: None,
            string: None,
        })
    }
}

impl Merger {
    /// Build a chain from parsed specs; unknown merger names are an error
    pub fn construct(specs: &[MergerSpec]) -> Result<Self, CloudInitError> {
        let mut merger = Self {
            dict: None,
            list: None,
            string: None,
        };
        for (name, opts) in specs {
            match name.as_str() {
                "dict" => {
                    merger.dict.get_or_insert_with(|| DictMerger::new(opts));
                }
                "list" => {
                    merger.list.get_or_insert_with(|| ListMerger::new(opts));
                }
                "str" => {
                    merger.string.get_or_insert_with(|| StrMerger {
                        append: opts.iter().any(|o| o == "append"),
                    });
                }
                other => {
                    return Err(CloudInitError::Config(format!(
                        "Could not find merger module named '{other}'"
                    )));
                }
            }
        }
        Ok(merger)
    }

    pub fn from_merge_how(merge_how: &str) -> Result<Self, CloudInitError> {
        Self::construct(&parse_merge_how(merge_how)?)
    }

    /// Merge `new` into `old`, dispatching on the type of `old`
    pub fn merge(&self, old: &Value, new: &Value) -> Value {
        match old {
            Value::Mapping(old_map) => match (&self.dict, new) {
                (Some(dm), Value::Mapping(new_map)) => self.merge_dict(dm, old_map, new_map),
                _ => old.clone(),
            },
            Value::Sequence(old_seq) => match &self.list {
                Some(lm) => self.merge_list(lm, old_seq, new),
                None => old.clone(),
            },
            Value::String(old_s) => match (&self.string, new) {
                (Some(sm), Value::String(new_s)) if sm.append => {
                    Value::String(format!("{old_s}{new_s}"))
                }
                (Some(_), _) => new.clone(),
                (None, _) => old.clone(),
            },
            Value::Tagged(tagged) => self.merge(&tagged.value, new),
            _ => new.clone(),
        }
    }

    fn merge_dict(&self, dm: &DictMerger, old: &Mapping, new: &Mapping) -> Value {
        let mut result = old.clone();
        for (key, new_v) in new {
            let Some(old_v) = result.get(key) else {
                result.insert(key.clone(), new_v.clone());
                continue;
            };
            if new_v.is_null() && dm.allow_delete {
                result.remove(key);
                continue;
            }
            let merged = match dm.method {
                DictMethod::Recurse => self.merge(old_v, new_v),
                DictMethod::Replace | DictMethod::NoReplace => {
                    let recurse = match new_v {
                        Value::Sequence(_) => dm.recurse_array,
                        Value::String(_) => dm.recurse_str,
                        Value::Mapping(_) => dm.method == DictMethod::NoReplace,
                        _ => false,
                    };
                    if recurse {
                        self.merge(old_v, new_v)
                    } else if dm.method == DictMethod::Replace {
                        new_v.clone()
                    } else {
                        old_v.clone()
                    }
                }
            };
            result.insert(key.clone(), merged);
        }
        Value::Mapping(result)
    }

    fn merge_list(&self, lm: &ListMerger, old: &[Value], new: &Value) -> Value {
        let new_seq = match new {
            Value::Sequence(s) => s.as_slice(),
            other => {
                return match lm.method {
                    ListMethod::Replace => other.clone(),
                    ListMethod::Append => {
                        let mut merged = old.to_vec();
                        merged.push(other.clone());
                        Value::Sequence(merged)
                    }
                    ListMethod::Prepend => {
                        let mut merged = vec![other.clone()];
                        merged.extend_from_slice(old);
                        Value::Sequence(merged)
                    }
                    ListMethod::NoReplace => Value::Sequence(old.to_vec()),
                };
            }
        };

        match lm.method {
            ListMethod::Append => Value::Sequence(old.iter().chain(new_seq).cloned().collect()),
            ListMethod::Prepend => Value::Sequence(new_seq.iter().chain(old).cloned().collect()),
            ListMethod::NoReplace => Value::Sequence(old.to_vec()),
            ListMethod::Replace if !lm.recurses() => Value::Sequence(new_seq.to_vec()),
            ListMethod::Replace => {
                // Index-wise: shared indexes merge, the longer tail survives
                let mut merged = old.to_vec();
                for (i, new_v) in new_seq.iter().enumerate() {
                    if i >= merged.len() {
                        merged.push(new_v.clone());
                        continue;
                    }
                    let recurse = match new_v {
                        Value::Sequence(_) => lm.recurse_array,
                        Value::String(_) => lm.recurse_str,
                        Value::Mapping(_) => lm.recurse_dict,
                        _ => false,
                    };
                    merged[i] = if recurse {
                        self.merge(&merged[i], new_v)
                    } else {
                        new_v.clone()
                    };
                }
                Value::Sequence(merged)
            }
        }
    }
}

/// Layer `overlay` on top of `base`
///
/// Mappings merge recursively; any other overlay value replaces the base
/// value outright. A null overlay keeps the base.
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            let mut result = base_map.clone();

            for (key, overlay_value) in overlay_map {
                let merged = match result.get(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value.clone(),
                };
                result.insert(key.clone(), merged);
            }

            Value::Mapping(result)
        }

        (base_value, Value::Null) => base_value.clone(),

        (_, overlay_value) => overlay_value.clone(),
    }
}

/// Fold config sources from lowest to highest precedence
///
/// A source carrying `merge_how` is folded in with that chain instead of
/// the default layering.
pub fn merge_all<I>(sources: I) -> Value
where
    I: IntoIterator<Item = Value>,
{
    let mut result = Value::Mapping(Mapping::new());
    for source in sources {
        let Value::Mapping(mut map) = source else {
            if !source.is_null() {
                debug!("Skipping non-mapping config source");
            }
            continue;
        };
        let chain = match extract_mergers(&mut map) {
            Ok(specs) if !specs.is_empty() => Merger::construct(&specs).ok(),
            Ok(_) => None,
            Err(e) => {
                debug!("Ignoring bad merge_how: {}", e);
                None
            }
        };
        let source = Value::Mapping(map);
        result = match chain {
            Some(merger) => merger.merge(&result, &source),
            None => deep_merge(&result, &source),
        };
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn y(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_parse_merge_how() {
        let parsed = parse_merge_how("dict(Recurse_Array, no-replace)+list(append)+str()").unwrap();
        assert_eq!(
            parsed,
            vec![
                ("dict".to_string(), vec!["recurse_array".to_string(), "no_replace".to_string()]),
                ("list".to_string(), vec!["append".to_string()]),
                ("str".to_string(), vec![]),
            ]
        );
        assert!(parse_merge_how("dict").is_err());
        assert!(parse_merge_how("9bad()").is_err());
    }

    #[test]
    fn test_unknown_merger_is_error() {
        assert!(Merger::from_merge_how("dict()+tuple()").is_err());
    }

    #[test]
    fn test_dict_list_append() {
        let m = Merger::from_merge_how("dict()+list(append)").unwrap();
        let merged = m.merge(&y("run: [b, c]"), &y("run: [d]"));
        assert_eq!(merged, y("run: [b, c, d]"));
    }

    #[test]
    fn test_default_part_merge_replaces() {
        let m = Merger::default();
        let merged = m.merge(&y("a: 1\nrun: [b, c]\nnest: {x: 1}"), &y("run: [d]\nnest: {y: 2}"));
        assert_eq!(merged, y("a: 1\nrun: [d]\nnest: {y: 2}"));
    }

    #[test]
    fn test_no_replace_keeps_old_but_recurses_dicts() {
        let m = Merger::from_merge_how("dict(no_replace)+list()+str()").unwrap();
        let merged = m.merge(&y("a: old\nnest: {x: 1}"), &y("a: new\nb: 2\nnest: {x: 9, y: 2}"));
        assert_eq!(merged, y("a: old\nb: 2\nnest: {x: 1, y: 2}"));
    }

    #[test]
    fn test_str_append_and_prepend_list() {
        let m = Merger::from_merge_how("dict()+list(prepend)+str(append)").unwrap();
        let merged = m.merge(&y("s: foo\nl: [1]"), &y("s: bar\nl: [2]"));
        assert_eq!(merged, y("s: foobar\nl: [2, 1]"));
    }

    #[test]
    fn test_allow_delete() {
        let m = Merger::from_merge_how("dict(allow_delete)+list()+str()").unwrap();
        let merged = m.merge(&y("a: 1\nb: 2"), &y("a: null"));
        assert_eq!(merged, y("b: 2"));
    }

    #[test]
    fn test_list_replace_with_recursion_is_index_wise() {
        let m = Merger::from_merge_how("dict()+list(recurse_dict)+str()").unwrap();
        let merged = m.merge(&y("- {a: 1}\n- {b: 2}"), &y("- {c: 3}"));
        assert_eq!(merged, y("- {a: 1, c: 3}\n- {b: 2}"));
    }

    #[test]
    fn test_extract_mergers_forms() {
        let mut map = y("merge_how: 'dict()+list(append)'\na: 1")
            .as_mapping()
            .unwrap()
            .clone();
        let specs = extract_mergers(&mut map).unwrap();
        assert_eq!(specs.len(), 2);
        assert!(map.get("merge_how").is_none());

        let mut map = y("merge_type:\n  - name: list\n    settings: [append]\n  - [dict, recurse_array]\n")
            .as_mapping()
            .unwrap()
            .clone();
        let specs = extract_mergers(&mut map).unwrap();
        assert_eq!(specs[0], ("list".to_string(), vec!["append".to_string()]));
        assert_eq!(specs[1], ("dict".to_string(), vec!["recurse_array".to_string()]));
    }

    #[test]
    fn test_deep_merge_overlay_wins() {
        let merged = deep_merge(
            &y("a: 1\nlist: [1, 2, 3]\nnest: {x: 1, y: 1}"),
            &y("a: 2\nlist: [9]\nnest: {y: 2}"),
        );
        assert_eq!(merged, y("a: 2\nlist: [9]\nnest: {x: 1, y: 2}"));
    }

    #[test]
    fn test_deep_merge_null_keeps_base() {
        assert_eq!(deep_merge(&y("a: 1"), &Value::Null), y("a: 1"));
    }

    #[test]
    fn test_merge_all_precedence() {
        let merged = merge_all(vec![y("a: 1\nb: 1"), y("a: 2"), Value::Null, y("a: 3")]);
        assert_eq!(merged, y("a: 3\nb: 1"));
    }

    #[test]
    fn test_merge_all_honours_merge_how() {
        let merged = merge_all(vec![
            y("packages: [a]"),
            y("merge_how: 'dict()+list(append)'\npackages: [b]"),
        ]);
        assert_eq!(merged, y("packages: [a, b]"));
    }
}

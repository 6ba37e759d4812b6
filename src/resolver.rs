//! `$ref` resolution with deep merge.
//!
//! A reference has the form `[file_path][#json_pointer]`: a path
//! relative to the referring file, a pointer into the current file, or
//! both. Resolution is bottom-up, so merges always see concrete values.
//! File references are confined to the resolver root and to a bounded
//! number of upward path segments.

use crate::error::{Error, Location, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

const REF_KEY: &str = "$ref";

/// Resolves documents into `$ref`-free trees.
pub struct RefResolver {
    root: PathBuf,
    max_parent_traversal_depth: usize,
    /// Raw documents by canonical path, loaded at most once.
    cache: HashMap<PathBuf, Value>,
}

impl RefResolver {
    pub fn new(root: impl Into<PathBuf>, max_parent_traversal_depth: usize) -> Self {
        Self {
            root: root.into(),
            max_parent_traversal_depth,
            cache: HashMap::new(),
        }
    }

    /// Load a JSON document from disk and resolve every `$ref` in it.
    pub fn resolve_file(&mut self, path: impl AsRef<Path>) -> Result<Value> {
        let canonical = self.canonicalize_under_root(path.as_ref())?;
        let doc = self.load(&canonical)?;
        let mut active = Vec::new();
        self.resolve_node(doc, &canonical, &mut active)
    }

    /// Resolve a document already in memory, treating `base_file` as
    /// its source for relative references.
    pub fn resolve(&mut self, doc: Value, base_file: &Path) -> Result<Value> {
        let mut active = Vec::new();
        self.resolve_node(doc, base_file, &mut active)
    }

    fn resolve_node(
        &mut self,
        node: Value,
        base_file: &Path,
        active: &mut Vec<(PathBuf, String)>,
    ) -> Result<Value> {
        match node {
            Value::Object(map) => self.resolve_object(map, base_file, active),
            Value::Array(items) => items
                .into_iter()
                .map(|item| self.resolve_node(item, base_file, active))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            scalar => Ok(scalar),
        }
    }

    fn resolve_object(
        &mut self,
        map: Map<String, Value>,
        base_file: &Path,
        active: &mut Vec<(PathBuf, String)>,
    ) -> Result<Value> {
        let mut reference = None;
        let mut siblings = Map::new();

        // Siblings resolve first, so the merge below always sees
        // concrete values on both sides.
        for (key, value) in map {
            if key == REF_KEY {
                let Value::String(target) = value else {
                    return Err(Error::validation(format!(
                        "$ref must be a string, got {}",
                        crate::model::json_kind(&value)
                    ))
                    .with_location(Location::in_file(base_file)));
                };
                reference = Some(target);
            } else {
                siblings.insert(key, self.resolve_node(value, base_file, active)?);
            }
        }

        let Some(target) = reference else {
            return Ok(Value::Object(siblings));
        };

        let referenced = self.follow(&target, base_file, active)?;
        if siblings.is_empty() {
            Ok(referenced)
        } else {
            deep_merge(referenced, Value::Object(siblings))
                .map_err(|e| e.with_location(Location::in_file(base_file)))
        }
    }

    /// Dereference `[file][#pointer]`, then resolve the fragment.
    fn follow(
        &mut self,
        target: &str,
        base_file: &Path,
        active: &mut Vec<(PathBuf, String)>,
    ) -> Result<Value> {
        let (file_part, pointer) = match target.split_once('#') {
            Some((file, ptr)) => (file, ptr),
            None => (target, ""),
        };

        let referenced_file = if file_part.is_empty() {
            base_file.to_path_buf()
        } else {
            self.check_path(Path::new(file_part), base_file.parent())?
        };

        let frame = (referenced_file.clone(), pointer.to_string());
        if active.contains(&frame) {
            let chain = active
                .iter()
                .map(|(p, ptr)| format!("{}#{ptr}", p.display()))
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(Error::Cycle {
                chain: format!("{chain} -> {}#{pointer}", referenced_file.display()),
                location: Location::in_file(base_file),
            });
        }

        let doc = self.load(&referenced_file)?;
        let fragment = if pointer.is_empty() {
            doc
        } else {
            doc.pointer(pointer)
                .cloned()
                .ok_or_else(|| Error::Pointer {
                    pointer: pointer.to_string(),
                    location: Location::in_file(&referenced_file),
                })?
        };

        debug!(
            target = %target,
            file = %referenced_file.display(),
            "resolved reference"
        );

        active.push(frame);
        let resolved = self.resolve_node(fragment, &referenced_file, active);
        active.pop();
        resolved
    }

    /// Enforce the upward-traversal budget and root containment.
    fn check_path(&self, relative: &Path, base_dir: Option<&Path>) -> Result<PathBuf> {
        let parent_hops = relative
            .components()
            .filter(|c| matches!(c, Component::ParentDir))
            .count();
        if parent_hops > self.max_parent_traversal_depth {
            return Err(Error::path(format!(
                "'{}' traverses {parent_hops} levels up, limit is {}",
                relative.display(),
                self.max_parent_traversal_depth
            )));
        }

        let joined = match base_dir {
            Some(dir) if relative.is_relative() => dir.join(relative),
            _ => relative.to_path_buf(),
        };
        self.canonicalize_under_root(&joined)
    }

    fn canonicalize_under_root(&self, path: &Path) -> Result<PathBuf> {
        let canonical = path
            .canonicalize()
            .map_err(|e| Error::path(format!("cannot resolve '{}': {e}", path.display())))?;

        let root = self
            .root
            .canonicalize()
            .map_err(|e| Error::path(format!("bad root '{}': {e}", self.root.display())))?;
        if !canonical.starts_with(&root) {
            return Err(Error::path(format!(
                "'{}' escapes the scenario root '{}'",
                canonical.display(),
                root.display()
            )));
        }

        Ok(canonical)
    }

    fn load(&mut self, canonical: &Path) -> Result<Value> {
        if let Some(doc) = self.cache.get(canonical) {
            return Ok(doc.clone());
        }
        let text = std::fs::read_to_string(canonical).map_err(|e| {
            Error::path(format!("cannot read '{}': {e}", canonical.display()))
        })?;
        let doc: Value = serde_json::from_str(&text).map_err(|e| {
            Error::validation(format!("invalid JSON: {e}"))
                .with_location(Location::in_file(canonical))
        })?;
        self.cache.insert(canonical.to_path_buf(), doc.clone());
        Ok(doc)
    }
}

/// Merge `overlay` into `base`: mappings merge recursively, lists are
/// replaced entirely, scalars are taken from the overlay. A container
/// on one side and a different kind on the other is a merge error.
pub fn deep_merge(base: Value, overlay: Value) -> Result<Value> {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                if let Some(slot) = base_map.get_mut(&key) {
                    let base_value = slot.take();
                    *slot = deep_merge(base_value, overlay_value)?;
                } else {
                    base_map.insert(key, overlay_value);
                }
            }
            Ok(Value::Object(base_map))
        }
        (Value::Array(_), overlay @ Value::Array(_)) => Ok(overlay),
        (base, overlay) => {
            let base_is_container = matches!(base, Value::Object(_) | Value::Array(_));
            let overlay_is_container = matches!(overlay, Value::Object(_) | Value::Array(_));
            if base_is_container || overlay_is_container {
                return Err(Error::Merge {
                    expected: crate::model::json_kind(&base),
                    found: crate::model::json_kind(&overlay),
                    location: Location::default(),
                });
            }
            Ok(overlay)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn write_doc(dir: &TempDir, name: &str, doc: &Value) -> PathBuf {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, serde_json::to_string_pretty(doc).unwrap()).unwrap();
        path
    }

    fn resolver_for(dir: &TempDir) -> RefResolver {
        RefResolver::new(dir.path(), 3)
    }

    #[test]
    fn plain_document_passes_through() {
        let dir = TempDir::new().unwrap();
        let path = write_doc(&dir, "a.json", &json!({"x": [1, 2], "y": {"z": true}}));
        let mut resolver = resolver_for(&dir);
        let doc = resolver.resolve_file(&path).unwrap();
        assert_eq!(doc, json!({"x": [1, 2], "y": {"z": true}}));
    }

    #[test]
    fn sibling_deep_merge_matches_reference_semantics() {
        let dir = TempDir::new().unwrap();
        write_doc(
            &dir,
            "base.json",
            &json!({"request": {"url": "/a", "headers": {"H": "1"}, "timeout": 30}}),
        );
        let caller = write_doc(
            &dir,
            "caller.json",
            &json!({
                "$ref": "base.json",
                "request": {"url": "/b", "headers": {"X": "2"}}
            }),
        );

        let mut resolver = resolver_for(&dir);
        let doc = resolver.resolve_file(&caller).unwrap();
        assert_eq!(
            doc,
            json!({
                "request": {
                    "url": "/b",
                    "headers": {"H": "1", "X": "2"},
                    "timeout": 30
                }
            })
        );
    }

    #[test]
    fn lists_replace_entirely() {
        assert_eq!(
            deep_merge(json!({"a": [1, 2, 3]}), json!({"a": [9]})).unwrap(),
            json!({"a": [9]})
        );
    }

    #[test]
    fn container_scalar_mismatch_fails() {
        let err = deep_merge(json!({"a": {"b": 1}}), json!({"a": "scalar"})).unwrap_err();
        assert!(matches!(err, Error::Merge { .. }));
    }

    #[test]
    fn merge_is_associative_for_compatible_maps() {
        let a = json!({"x": {"p": 1}});
        let b = json!({"x": {"q": 2}});
        let c = json!({"x": {"p": 3, "r": 4}});

        let left = deep_merge(deep_merge(a.clone(), b.clone()).unwrap(), c.clone()).unwrap();
        let right = deep_merge(a, deep_merge(b, c).unwrap()).unwrap();
        assert_eq!(left, right);
        assert_eq!(left, json!({"x": {"p": 3, "q": 2, "r": 4}}));
    }

    #[test]
    fn merge_commutes_only_for_disjoint_keys() {
        let a = json!({"x": 1});
        let b = json!({"y": 2});
        assert_eq!(
            deep_merge(a.clone(), b.clone()).unwrap(),
            deep_merge(b.clone(), a.clone()).unwrap()
        );

        let c = json!({"x": 9});
        assert_ne!(
            deep_merge(a.clone(), c.clone()).unwrap(),
            deep_merge(c, a).unwrap()
        );
    }

    #[test]
    fn pointer_into_same_file() {
        let dir = TempDir::new().unwrap();
        let path = write_doc(
            &dir,
            "doc.json",
            &json!({
                "defaults": {"timeout": 5},
                "stage": {"$ref": "#/defaults"}
            }),
        );
        let mut resolver = resolver_for(&dir);
        let doc = resolver.resolve_file(&path).unwrap();
        assert_eq!(doc["stage"], json!({"timeout": 5}));
    }

    #[test]
    fn missing_pointer_fails() {
        let dir = TempDir::new().unwrap();
        write_doc(&dir, "base.json", &json!({"a": 1}));
        let caller = write_doc(&dir, "c.json", &json!({"$ref": "base.json#/nope"}));
        let mut resolver = resolver_for(&dir);
        let err = resolver.resolve_file(&caller).unwrap_err();
        assert!(matches!(err, Error::Pointer { .. }));
    }

    #[test]
    fn nested_refs_resolve_bottom_up() {
        let dir = TempDir::new().unwrap();
        write_doc(&dir, "inner.json", &json!({"leaf": 42}));
        write_doc(
            &dir,
            "middle.json",
            &json!({"from_inner": {"$ref": "inner.json"}}),
        );
        let caller = write_doc(&dir, "outer.json", &json!({"$ref": "middle.json"}));

        let mut resolver = resolver_for(&dir);
        let doc = resolver.resolve_file(&caller).unwrap();
        assert_eq!(doc, json!({"from_inner": {"leaf": 42}}));
    }

    #[test]
    fn cycle_detected() {
        let dir = TempDir::new().unwrap();
        write_doc(&dir, "a.json", &json!({"$ref": "b.json"}));
        write_doc(&dir, "b.json", &json!({"$ref": "a.json"}));
        let mut resolver = resolver_for(&dir);
        let err = resolver
            .resolve_file(dir.path().join("a.json"))
            .unwrap_err();
        assert!(matches!(err, Error::Cycle { .. }));
    }

    #[test]
    fn self_pointer_cycle_detected() {
        let dir = TempDir::new().unwrap();
        let path = write_doc(&dir, "a.json", &json!({"loop": {"$ref": "#/loop"}}));
        let mut resolver = resolver_for(&dir);
        let err = resolver.resolve_file(&path).unwrap_err();
        assert!(matches!(err, Error::Cycle { .. }));
    }

    #[test]
    fn parent_traversal_at_limit_succeeds_and_past_limit_fails() {
        let dir = TempDir::new().unwrap();
        write_doc(&dir, "shared.json", &json!({"ok": true}));
        let caller = write_doc(
            &dir,
            "a/b/caller.json",
            &json!({"$ref": "../../shared.json"}),
        );

        // Exactly two hops with a budget of two: fine.
        let mut resolver = RefResolver::new(dir.path(), 2);
        assert!(resolver.resolve_file(&caller).is_ok());

        // Budget of one: the same reference is rejected.
        let mut strict = RefResolver::new(dir.path(), 1);
        let err = strict.resolve_file(&caller).unwrap_err();
        assert!(matches!(err, Error::Path { .. }));
    }

    #[test]
    fn escape_from_root_fails() {
        let outer = TempDir::new().unwrap();
        let root = outer.path().join("root");
        fs::create_dir_all(&root).unwrap();
        fs::write(outer.path().join("secret.json"), "{}").unwrap();
        let caller = root.join("caller.json");
        fs::write(
            &caller,
            serde_json::to_string(&json!({"$ref": "../secret.json"})).unwrap(),
        )
        .unwrap();

        let mut resolver = RefResolver::new(&root, 3);
        let err = resolver.resolve_file(&caller).unwrap_err();
        assert!(matches!(err, Error::Path { .. }));
    }

    #[test]
    fn resolved_document_has_no_refs_left() {
        let dir = TempDir::new().unwrap();
        write_doc(&dir, "frag.json", &json!({"deep": {"$ref": "#/val"}, "val": 7}));
        let caller = write_doc(
            &dir,
            "main.json",
            &json!({"a": {"$ref": "frag.json#/deep"}, "b": [{"$ref": "frag.json#/val"}]}),
        );

        let mut resolver = resolver_for(&dir);
        let doc = resolver.resolve_file(&caller).unwrap();
        let text = serde_json::to_string(&doc).unwrap();
        assert!(!text.contains("$ref"));
        assert_eq!(doc, json!({"a": 7, "b": [7]}));
    }
}

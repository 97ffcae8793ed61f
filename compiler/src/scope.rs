use std::collections::HashMap;

use crate::error::RuntimeError;
use crate::value::Value;

/// Handle to a scope inside a [`Scopes`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeId(usize);

#[derive(Debug, Default)]
struct Scope {
    variables: HashMap<String, Value>,
    parent: Option<ScopeId>,
}

/// All scopes of one compile, linked by parent handles.
///
/// Lookup walks parents, which only exist within a single document: a
/// referenced document starts from an isolated root, so nothing flows across
/// the reference boundary in either direction.
#[derive(Debug, Default)]
pub struct Scopes {
    scopes: Vec<Scope>,
    /// Released slots, handed out again before the arena grows.
    free: Vec<ScopeId>,
}

impl Scopes {
    pub fn new() -> Self {
        Scopes::default()
    }

    /// Root scope of the main document, seeded with the compile parameters.
    pub fn root(&mut self, variables: HashMap<String, Value>) -> ScopeId {
        self.push(Scope { variables, parent: None })
    }

    /// Root scope of a referenced document, seeded only with the attributes passed to it.
    pub fn isolated(&mut self, variables: HashMap<String, Value>) -> ScopeId {
        self.push(Scope { variables, parent: None })
    }

    /// Nested scope for a loop iteration or conditional branch.
    pub fn child(&mut self, parent: ScopeId) -> ScopeId {
        self.push(Scope {
            variables: HashMap::new(),
            parent: Some(parent),
        })
    }

    fn push(&mut self, scope: Scope) -> ScopeId {
        if let Some(id) = self.free.pop() {
            self.scopes[id.0] = scope;
            return id;
        }
        self.scopes.push(scope);
        ScopeId(self.scopes.len() - 1)
    }

    /// Drop the bindings of a scope nothing refers to any more and recycle its slot.
    ///
    /// The caller must not use `id`, or any child of it, afterwards.
    pub fn release(&mut self, id: ScopeId) {
        if let Some(scope) = self.scopes.get_mut(id.0) {
            *scope = Scope::default();
            self.free.push(id);
        }
    }

    /// Scopes currently in use.
    pub fn live(&self) -> usize {
        self.scopes.len() - self.free.len()
    }

    /// Bind `name` in this exact scope, shadowing any outer binding.
    pub fn declare(&mut self, id: ScopeId, name: impl Into<String>, value: Value) {
        self.scopes[id.0].variables.insert(name.into(), value);
    }

    pub fn get(&self, id: ScopeId, name: &str) -> Result<&Value, RuntimeError> {
        self.owner(id, name)
            .and_then(|owner| self.scopes[owner.0].variables.get(name))
            .ok_or_else(|| RuntimeError::VariableNotDeclared(name.to_string()))
    }

    /// Update the nearest existing binding, or declare in `id` if there is none.
    pub fn assign(&mut self, id: ScopeId, name: &str, value: Value) {
        let owner = self.owner(id, name).unwrap_or(id);
        self.scopes[owner.0].variables.insert(name.to_string(), value);
    }

    fn owner(&self, id: ScopeId, name: &str) -> Option<ScopeId> {
        let mut current = Some(id);
        while let Some(scope_id) = current {
            let scope = &self.scopes[scope_id.0];
            if scope.variables.contains_key(name) {
                return Some(scope_id);
            }
            current = scope.parent;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, i64)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), Value::from(*v))).collect()
    }

    #[test]
    fn lookup_walks_parents() {
        let mut scopes = Scopes::new();
        let root = scopes.root(vars(&[("a", 1)]));
        let child = scopes.child(root);
        assert_eq!(scopes.get(child, "a"), Ok(&Value::Number(1.0)));
    }

    #[test]
    fn assign_updates_the_owning_scope() {
        let mut scopes = Scopes::new();
        let root = scopes.root(vars(&[("a", 1)]));
        let child = scopes.child(root);
        scopes.assign(child, "a", Value::from(2i64));
        scopes.assign(child, "b", Value::from(3i64));
        assert_eq!(scopes.get(root, "a"), Ok(&Value::Number(2.0)));
        assert!(scopes.get(root, "b").is_err());
        assert_eq!(scopes.get(child, "b"), Ok(&Value::Number(3.0)));
    }

    #[test]
    fn isolated_scopes_see_nothing_outside() {
        let mut scopes = Scopes::new();
        let root = scopes.root(vars(&[("secret", 1)]));
        let inner = scopes.isolated(vars(&[("passed", 2)]));
        assert_eq!(scopes.get(inner, "passed"), Ok(&Value::Number(2.0)));
        assert_eq!(
            scopes.get(inner, "secret"),
            Err(RuntimeError::VariableNotDeclared("secret".into()))
        );
        scopes.assign(inner, "secret", Value::from(9i64));
        assert_eq!(scopes.get(root, "secret"), Ok(&Value::Number(1.0)));
    }

    #[test]
    fn declare_shadows() {
        let mut scopes = Scopes::new();
        let root = scopes.root(vars(&[("x", 1)]));
        let child = scopes.child(root);
        scopes.declare(child, "x", Value::from(5i64));
        assert_eq!(scopes.get(child, "x"), Ok(&Value::Number(5.0)));
        assert_eq!(scopes.get(root, "x"), Ok(&Value::Number(1.0)));
    }

    #[test]
    fn released_slots_are_reused_empty() {
        let mut scopes = Scopes::new();
        let root = scopes.root(vars(&[("a", 1)]));
        let child = scopes.child(root);
        scopes.declare(child, "x", Value::from(5i64));
        assert_eq!(scopes.live(), 2);

        scopes.release(child);
        assert_eq!(scopes.live(), 1);

        let next = scopes.isolated(HashMap::new());
        assert_eq!(next, child);
        assert_eq!(scopes.live(), 2);
        assert!(scopes.get(next, "x").is_err());
        assert!(scopes.get(next, "a").is_err());
        assert_eq!(scopes.get(root, "a"), Ok(&Value::Number(1.0)));
    }
}

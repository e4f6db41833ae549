//! Runtime-tunable named parameters.
//!
//! Every variable carries a typed value plus a list of subscribers. Subscribers
//! are invoked synchronously, in registration order, whenever a `set` actually
//! changes the value. Setting a variable to its current value is a no-op.

use std::collections::HashMap;
use std::fmt;

/// Value domain of a variable.
#[derive(Debug, Clone, PartialEq)]
pub enum CvarKind {
    Bool,
    Int { min: i32, max: i32, step: i32 },
    Float { min: f32, max: f32 },
    Enum { names: Vec<&'static str> },
}

/// Current value of a variable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CvarValue {
    Bool(bool),
    Int(i32),
    Float(f32),
    Enum(usize),
}

/// Subscriber invoked after a variable changed.
pub type CvarCallback = Box<dyn FnMut(&Cvar) + Send>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CvarError {
    #[error("unknown variable \"{0}\"")]
    Unknown(String),
    #[error("{name}: expected {expected} value")]
    TypeMismatch { name: String, expected: &'static str },
    #[error("{name}: cannot parse \"{text}\"")]
    Parse { name: String, text: String },
    #[error("{name}: enum index {index} out of range (0..{count})")]
    EnumOutOfRange { name: String, index: usize, count: usize },
}

/// A tunable variable.
#[derive(Debug, Clone)]
pub struct Cvar {
    pub name: String,
    pub kind: CvarKind,
    value: CvarValue,
    default: CvarValue,
    /// Set on every change, cleared by `CvarContext::clear_modified`.
    pub modified: bool,
}

impl Cvar {
    pub fn value(&self) -> CvarValue {
        self.value
    }

    pub fn default_value(&self) -> CvarValue {
        self.default
    }

    pub fn as_bool(&self) -> bool {
        match self.value {
            CvarValue::Bool(b) => b,
            CvarValue::Int(i) => i != 0,
            CvarValue::Float(f) => f != 0.0,
            CvarValue::Enum(e) => e != 0,
        }
    }

    pub fn as_int(&self) -> i32 {
        match self.value {
            CvarValue::Bool(b) => b as i32,
            CvarValue::Int(i) => i,
            CvarValue::Float(f) => f as i32,
            CvarValue::Enum(e) => e as i32,
        }
    }

    pub fn as_float(&self) -> f32 {
        match self.value {
            CvarValue::Bool(b) => b as i32 as f32,
            CvarValue::Int(i) => i as f32,
            CvarValue::Float(f) => f,
            CvarValue::Enum(e) => e as f32,
        }
    }

    pub fn as_enum(&self) -> usize {
        match self.value {
            CvarValue::Enum(e) => e,
            _ => self.as_int().max(0) as usize,
        }
    }

    /// Bring a candidate value into this variable's domain.
    fn coerce(&self, value: CvarValue) -> Result<CvarValue, CvarError> {
        let mismatch = |expected| CvarError::TypeMismatch { name: self.name.clone(), expected };
        match (&self.kind, value) {
            (CvarKind::Bool, CvarValue::Bool(b)) => Ok(CvarValue::Bool(b)),
            (CvarKind::Bool, CvarValue::Int(i)) => Ok(CvarValue::Bool(i != 0)),
            (CvarKind::Bool, _) => Err(mismatch("bool")),
            (CvarKind::Int { min, max, .. }, CvarValue::Int(i)) => Ok(CvarValue::Int(i.clamp(*min, *max))),
            (CvarKind::Int { .. }, _) => Err(mismatch("int")),
            (CvarKind::Float { min, max }, CvarValue::Float(f)) => Ok(CvarValue::Float(f.clamp(*min, *max))),
            (CvarKind::Float { min, max }, CvarValue::Int(i)) => Ok(CvarValue::Float((i as f32).clamp(*min, *max))),
            (CvarKind::Float { .. }, _) => Err(mismatch("float")),
            (CvarKind::Enum { names }, CvarValue::Enum(index)) => self.enum_index(index, names.len()),
            (CvarKind::Enum { names }, CvarValue::Int(i @ 0..)) => self.enum_index(i as usize, names.len()),
            (CvarKind::Enum { .. }, _) => Err(mismatch("enum")),
        }
    }

    fn enum_index(&self, index: usize, count: usize) -> Result<CvarValue, CvarError> {
        if index < count {
            Ok(CvarValue::Enum(index))
        } else {
            Err(CvarError::EnumOutOfRange { name: self.name.clone(), index, count })
        }
    }

    fn parse(&self, text: &str) -> Result<CvarValue, CvarError> {
        let bad = || CvarError::Parse { name: self.name.clone(), text: text.to_string() };
        let text = text.trim();
        match &self.kind {
            CvarKind::Bool => match text.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => Ok(CvarValue::Bool(true)),
                "0" | "false" | "off" | "no" => Ok(CvarValue::Bool(false)),
                _ => Err(bad()),
            },
            CvarKind::Int { .. } => text.parse::<i32>().map(CvarValue::Int).map_err(|_| bad()),
            CvarKind::Float { .. } => text.parse::<f32>().map(CvarValue::Float).map_err(|_| bad()),
            CvarKind::Enum { names } => {
                if let Some(index) = names.iter().position(|n| n.eq_ignore_ascii_case(text)) {
                    Ok(CvarValue::Enum(index))
                } else {
                    text.parse::<usize>().map(CvarValue::Enum).map_err(|_| bad())
                }
            }
        }
    }
}

impl fmt::Display for Cvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, self.value) {
            (CvarKind::Enum { names }, CvarValue::Enum(e)) => {
                write!(f, "{}", names.get(e).copied().unwrap_or("?"))
            }
            (_, CvarValue::Bool(b)) => write!(f, "{}", if b { "on" } else { "off" }),
            (_, CvarValue::Int(i)) => write!(f, "{}", i),
            (_, CvarValue::Float(v)) => write!(f, "{}", v),
            (_, CvarValue::Enum(e)) => write!(f, "{}", e),
        }
    }
}

/// Registry of tunable variables.
pub struct CvarContext {
    vars: Vec<Cvar>,
    /// O(1) lookup by name -> index in `vars`
    index: HashMap<String, usize>,
    /// Parallel to `vars`.
    subscribers: Vec<Vec<CvarCallback>>,
}

impl CvarContext {
    pub fn new() -> Self {
        Self {
            vars: Vec::new(),
            index: HashMap::new(),
            subscribers: Vec::new(),
        }
    }

    /// Find a variable's index by name.
    pub fn find_var_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn find_var(&self, name: &str) -> Option<&Cvar> {
        self.index.get(name).map(|&idx| &self.vars[idx])
    }

    pub fn vars(&self) -> impl Iterator<Item = &Cvar> {
        self.vars.iter()
    }

    /// Get-or-create. An existing variable keeps its current value.
    fn register(&mut self, name: &str, kind: CvarKind, default: CvarValue) -> usize {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }

        let idx = self.vars.len();
        self.vars.push(Cvar {
            name: name.to_string(),
            kind,
            value: default,
            default,
            modified: true,
        });
        self.subscribers.push(Vec::new());
        self.index.insert(name.to_string(), idx);
        idx
    }

    pub fn register_bool(&mut self, name: &str, default: bool) -> usize {
        self.register(name, CvarKind::Bool, CvarValue::Bool(default))
    }

    pub fn register_int(&mut self, name: &str, default: i32, min: i32, max: i32, step: i32) -> usize {
        let default = default.clamp(min, max);
        self.register(name, CvarKind::Int { min, max, step: step.max(1) }, CvarValue::Int(default))
    }

    pub fn register_float(&mut self, name: &str, default: f32, min: f32, max: f32) -> usize {
        let default = default.clamp(min, max);
        self.register(name, CvarKind::Float { min, max }, CvarValue::Float(default))
    }

    pub fn register_enum(&mut self, name: &str, default: usize, names: &[&'static str]) -> usize {
        let default = default.min(names.len().saturating_sub(1));
        self.register(name, CvarKind::Enum { names: names.to_vec() }, CvarValue::Enum(default))
    }

    /// Add a change subscriber to an existing variable.
    pub fn subscribe(&mut self, name: &str, callback: CvarCallback) -> Result<(), CvarError> {
        let idx = self.find_var_index(name)
            .ok_or_else(|| CvarError::Unknown(name.to_string()))?;
        self.subscribers[idx].push(callback);
        Ok(())
    }

    fn set_index(&mut self, idx: usize, value: CvarValue) -> Result<bool, CvarError> {
        let value = self.vars[idx].coerce(value)?;
        if value == self.vars[idx].value {
            return Ok(false);
        }

        let var = &mut self.vars[idx];
        log::debug!("{} = {:?} (was {:?})", var.name, value, var.value);
        var.value = value;
        var.modified = true;

        let var = &self.vars[idx];
        for callback in self.subscribers[idx].iter_mut() {
            callback(var);
        }
        Ok(true)
    }

    /// Set a variable. Returns whether the value changed.
    pub fn set(&mut self, name: &str, value: CvarValue) -> Result<bool, CvarError> {
        let idx = self.find_var_index(name)
            .ok_or_else(|| CvarError::Unknown(name.to_string()))?;
        self.set_index(idx, value)
    }

    /// Set a variable from its textual form (`+set name value`).
    pub fn set_from_str(&mut self, name: &str, text: &str) -> Result<bool, CvarError> {
        let idx = self.find_var_index(name)
            .ok_or_else(|| CvarError::Unknown(name.to_string()))?;
        let value = self.vars[idx].parse(text)?;
        self.set_index(idx, value)
    }

    /// Nudge a variable like a tuning UI would: ints move by their step,
    /// floats by a tenth of their range, bools toggle, enums cycle.
    pub fn adjust(&mut self, name: &str, direction: i32) -> Result<bool, CvarError> {
        let idx = self.find_var_index(name)
            .ok_or_else(|| CvarError::Unknown(name.to_string()))?;
        let var = &self.vars[idx];
        let next = match (&var.kind, var.value) {
            (CvarKind::Bool, CvarValue::Bool(b)) => CvarValue::Bool(!b),
            (CvarKind::Int { step, .. }, CvarValue::Int(i)) => {
                CvarValue::Int(i.saturating_add(step.saturating_mul(direction.signum())))
            }
            (CvarKind::Float { min, max }, CvarValue::Float(f)) => {
                CvarValue::Float(f + (max - min) * 0.1 * direction.signum() as f32)
            }
            (CvarKind::Enum { names }, CvarValue::Enum(e)) => {
                let count = names.len() as i64;
                CvarValue::Enum((e as i64 + direction.signum() as i64).rem_euclid(count.max(1)) as usize)
            }
            (_, value) => value,
        };
        self.set_index(idx, next)
    }

    pub fn reset_to_default(&mut self, name: &str) -> Result<bool, CvarError> {
        let idx = self.find_var_index(name)
            .ok_or_else(|| CvarError::Unknown(name.to_string()))?;
        let default = self.vars[idx].default;
        self.set_index(idx, default)
    }

    /// Boolean value of a variable. Returns false if not found.
    pub fn value_bool(&self, name: &str) -> bool {
        self.find_var(name).is_some_and(Cvar::as_bool)
    }

    /// Integer value of a variable. Returns 0 if not found.
    pub fn value_int(&self, name: &str) -> i32 {
        self.find_var(name).map_or(0, Cvar::as_int)
    }

    /// Float value of a variable. Returns 0 if not found.
    pub fn value_float(&self, name: &str) -> f32 {
        self.find_var(name).map_or(0.0, Cvar::as_float)
    }

    /// Enum index of a variable. Returns 0 if not found.
    pub fn value_enum(&self, name: &str) -> usize {
        self.find_var(name).map_or(0, Cvar::as_enum)
    }

    /// Clear the modified flag, returning its previous state.
    pub fn clear_modified(&mut self, name: &str) -> bool {
        match self.index.get(name) {
            Some(&idx) => std::mem::take(&mut self.vars[idx].modified),
            None => false,
        }
    }

    /// Variables whose name matches `pattern` (`*` and `?` wildcards),
    /// in registration order.
    pub fn list(&self, pattern: Option<&str>) -> Vec<&Cvar> {
        let pattern = pattern.unwrap_or("*");
        let matching: Vec<&Cvar> = self.vars
            .iter()
            .filter(|v| wildcard_match(pattern.as_bytes(), v.name.as_bytes()))
            .collect();
        for var in &matching {
            log::info!("{}{} \"{}\"", if var.modified { '*' } else { ' ' }, var.name, var);
        }
        log::info!("{} vars, {} matching", self.vars.len(), matching.len());
        matching
    }
}

impl Default for CvarContext {
    fn default() -> Self {
        Self::new()
    }
}

fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            wildcard_match(&pattern[1..], text)
                || (!text.is_empty() && wildcard_match(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => wildcard_match(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => wildcard_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn counter_callback(counter: &Arc<AtomicUsize>) -> CvarCallback {
        let counter = Arc::clone(counter);
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    // ============================================================
    // Registration
    // ============================================================

    #[test]
    fn test_register_and_find() {
        let mut ctx = CvarContext::new();
        ctx.register_int("geo_per_blas", 4, 1, 1000, 1);
        assert_eq!(ctx.value_int("geo_per_blas"), 4);
        assert!(ctx.find_var("geo_per_blas").is_some());
        assert!(ctx.find_var("missing").is_none());
        assert_eq!(ctx.value_int("missing"), 0);
    }

    #[test]
    fn test_register_is_get_or_create() {
        let mut ctx = CvarContext::new();
        let a = ctx.register_bool("flag", true);
        ctx.set("flag", CvarValue::Bool(false)).unwrap();
        let b = ctx.register_bool("flag", true);
        assert_eq!(a, b);
        assert!(!ctx.value_bool("flag"));
    }

    #[test]
    fn test_register_clamps_default() {
        let mut ctx = CvarContext::new();
        ctx.register_int("freq", 5000, 1, 1200, 1);
        assert_eq!(ctx.value_int("freq"), 1200);
    }

    // ============================================================
    // set / callbacks
    // ============================================================

    #[test]
    fn test_set_invokes_subscribers_once_per_change() {
        let mut ctx = CvarContext::new();
        let hits = Arc::new(AtomicUsize::new(0));
        ctx.register_int("geo_tesselation", 14, 0, 80, 1);
        ctx.subscribe("geo_tesselation", counter_callback(&hits)).unwrap();

        assert!(ctx.set("geo_tesselation", CvarValue::Int(20)).unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Same value: no change, no callback.
        assert!(!ctx.set("geo_tesselation", CvarValue::Int(20)).unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribers_run_in_registration_order() {
        let mut ctx = CvarContext::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        ctx.register_bool("flag", false);
        for tag in 0..3 {
            let order = Arc::clone(&order);
            ctx.subscribe("flag", Box::new(move |_| order.lock().unwrap().push(tag))).unwrap();
        }
        ctx.set("flag", CvarValue::Bool(true)).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_callback_sees_new_value() {
        let mut ctx = CvarContext::new();
        let seen = Arc::new(AtomicUsize::new(0));
        ctx.register_int("n", 1, 1, 100, 1);
        let seen_cb = Arc::clone(&seen);
        ctx.subscribe("n", Box::new(move |var| {
            seen_cb.store(var.as_int() as usize, Ordering::SeqCst);
        })).unwrap();
        ctx.set("n", CvarValue::Int(42)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_set_clamps_int() {
        let mut ctx = CvarContext::new();
        ctx.register_int("freq", 1, 1, 1200, 1);
        ctx.set("freq", CvarValue::Int(0)).unwrap();
        assert_eq!(ctx.value_int("freq"), 1);
        ctx.set("freq", CvarValue::Int(99999)).unwrap();
        assert_eq!(ctx.value_int("freq"), 1200);
    }

    #[test]
    fn test_set_unknown() {
        let mut ctx = CvarContext::new();
        assert_eq!(
            ctx.set("nope", CvarValue::Int(1)),
            Err(CvarError::Unknown("nope".to_string()))
        );
        assert!(ctx.subscribe("nope", Box::new(|_| {})).is_err());
    }

    #[test]
    fn test_set_type_mismatch() {
        let mut ctx = CvarContext::new();
        ctx.register_bool("flag", false);
        assert!(matches!(
            ctx.set("flag", CvarValue::Float(1.0)),
            Err(CvarError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_enum_rejects_out_of_range() {
        let mut ctx = CvarContext::new();
        ctx.register_enum("mode", 0, &["build", "update"]);
        assert!(matches!(
            ctx.set("mode", CvarValue::Enum(2)),
            Err(CvarError::EnumOutOfRange { index: 2, count: 2, .. })
        ));
        assert_eq!(ctx.value_enum("mode"), 0);
    }

    // ============================================================
    // set_from_str
    // ============================================================

    #[test]
    fn test_set_from_str_parses_each_kind() {
        let mut ctx = CvarContext::new();
        ctx.register_bool("b", false);
        ctx.register_int("i", 0, -10, 10, 1);
        ctx.register_float("f", 0.0, 0.0, 1.0);
        ctx.register_enum("e", 0, &["build", "update", "update_build_every_x_frames"]);

        ctx.set_from_str("b", "on").unwrap();
        ctx.set_from_str("i", "-3").unwrap();
        ctx.set_from_str("f", "0.25").unwrap();
        ctx.set_from_str("e", "Update").unwrap();

        assert!(ctx.value_bool("b"));
        assert_eq!(ctx.value_int("i"), -3);
        assert_eq!(ctx.value_float("f"), 0.25);
        assert_eq!(ctx.value_enum("e"), 1);

        ctx.set_from_str("e", "2").unwrap();
        assert_eq!(ctx.value_enum("e"), 2);
    }

    #[test]
    fn test_set_from_str_rejects_garbage() {
        let mut ctx = CvarContext::new();
        ctx.register_int("i", 0, 0, 10, 1);
        assert!(matches!(ctx.set_from_str("i", "ten"), Err(CvarError::Parse { .. })));
    }

    // ============================================================
    // adjust / reset
    // ============================================================

    #[test]
    fn test_adjust() {
        let mut ctx = CvarContext::new();
        ctx.register_int("i", 10, 0, 20, 5);
        ctx.register_bool("b", false);
        ctx.register_enum("e", 0, &["a", "b", "c"]);

        ctx.adjust("i", 1).unwrap();
        assert_eq!(ctx.value_int("i"), 15);
        ctx.adjust("i", 1).unwrap();
        ctx.adjust("i", 1).unwrap();
        assert_eq!(ctx.value_int("i"), 20);

        ctx.adjust("b", 1).unwrap();
        assert!(ctx.value_bool("b"));

        ctx.adjust("e", -1).unwrap();
        assert_eq!(ctx.value_enum("e"), 2);
    }

    #[test]
    fn test_reset_to_default() {
        let mut ctx = CvarContext::new();
        ctx.register_int("i", 3, 0, 10, 1);
        ctx.set("i", CvarValue::Int(7)).unwrap();
        assert!(ctx.reset_to_default("i").unwrap());
        assert_eq!(ctx.value_int("i"), 3);
    }

    // ============================================================
    // modified / list
    // ============================================================

    #[test]
    fn test_modified_flag() {
        let mut ctx = CvarContext::new();
        ctx.register_bool("b", false);
        assert!(ctx.clear_modified("b"));
        assert!(!ctx.clear_modified("b"));
        ctx.set("b", CvarValue::Bool(true)).unwrap();
        assert!(ctx.clear_modified("b"));
    }

    #[test]
    fn test_list_pattern() {
        let mut ctx = CvarContext::new();
        ctx.register_int("as_build_frequency", 1, 1, 1200, 1);
        ctx.register_bool("as_allow_update", true);
        ctx.register_int("geo_per_blas", 1, 1, 1000, 1);

        assert_eq!(ctx.list(None).len(), 3);
        let names: Vec<&str> = ctx.list(Some("as_*")).iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["as_build_frequency", "as_allow_update"]);
        assert_eq!(ctx.list(Some("geo_per_bla?")).len(), 1);
        assert!(ctx.list(Some("zzz*")).is_empty());
    }

    #[test]
    fn test_display_enum_name() {
        let mut ctx = CvarContext::new();
        ctx.register_enum("mode", 1, &["build", "update"]);
        assert_eq!(ctx.find_var("mode").unwrap().to_string(), "update");
    }
}

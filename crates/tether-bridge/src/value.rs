//! Dynamically typed host values.
//!
//! [`HostValue`] is what a handle names. Reference-like variants share their
//! payload through `Rc`, so cloning a value (and therefore cloning a handle)
//! never duplicates the underlying object.

use std::any::Any;
use std::cell::{Ref, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::ser::{Error as _, SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use tether_types::abi::{ARRAY_F32, ARRAY_I32, ARRAY_U32, ARRAY_U8};
use tether_types::HostException;

use crate::closure::Closure;

/// Nesting depth past which rendering and serialisation give up.
const MAX_DEPTH: usize = 32;

/// Values one rendering or serialisation visits before eliding the rest.
/// Shared sub-arrays are walked once per occurrence, so depth alone does not
/// bound the work.
const MAX_NODES: usize = 10_000;

/// Largest run of holes a single array write may open up.
const MAX_ARRAY_GAP: usize = 1 << 16;

/// Signature of a host-native function.
pub type HostFn = dyn Fn(&[HostValue]) -> Result<HostValue, HostException>;

/// A host-native callable.
#[derive(Clone)]
pub struct HostFunction {
    name: Rc<str>,
    func: Rc<HostFn>,
}

impl HostFunction {
    pub fn new(
        name: &str,
        func: impl Fn(&[HostValue]) -> Result<HostValue, HostException> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Rc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: &[HostValue]) -> Result<HostValue, HostException> {
        (self.func)(args)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.func, &other.func)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFunction({})", self.name)
    }
}

/// Element type of a [`TypedArray`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayKind {
    U8,
    I32,
    U32,
    F32,
}

impl ArrayKind {
    /// Decode the `kind` argument of `array_from_guest`.
    pub fn from_abi(code: i32) -> Option<Self> {
        match code {
            ARRAY_U8 => Some(Self::U8),
            ARRAY_I32 => Some(Self::I32),
            ARRAY_U32 => Some(Self::U32),
            ARRAY_F32 => Some(Self::F32),
            _ => None,
        }
    }

    /// Element width in bytes.
    pub const fn width(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I32 | Self::U32 | Self::F32 => 4,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::U8 => "Uint8Array",
            Self::I32 => "Int32Array",
            Self::U32 => "Uint32Array",
            Self::F32 => "Float32Array",
        }
    }
}

/// A host-owned typed array, stored as little-endian bytes.
///
/// Arrays built from guest memory are copies: they stay valid after the
/// guest memory grows.
#[derive(Debug, Clone)]
pub struct TypedArray {
    kind: ArrayKind,
    bytes: Rc<RefCell<Vec<u8>>>,
}

impl TypedArray {
    /// Wrap raw little-endian bytes. Trailing bytes that do not fill a whole
    /// element are dropped.
    pub fn from_bytes(kind: ArrayKind, mut bytes: Vec<u8>) -> Self {
        bytes.truncate(bytes.len() - bytes.len() % kind.width());
        Self {
            kind,
            bytes: Rc::new(RefCell::new(bytes)),
        }
    }

    pub fn from_f32(values: &[f32]) -> Self {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_bytes(ArrayKind::F32, bytes)
    }

    pub fn kind(&self) -> ArrayKind {
        self.kind
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.bytes.borrow().len() / self.kind.width()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> Ref<'_, Vec<u8>> {
        self.bytes.borrow()
    }

    /// Element `index` widened to a number.
    pub fn get(&self, index: usize) -> Option<f64> {
        let width = self.kind.width();
        let bytes = self.bytes.borrow();
        let chunk = bytes.get(index * width..(index + 1) * width)?;
        let mut word = [0u8; 4];
        word[..width].copy_from_slice(chunk);
        Some(match self.kind {
            ArrayKind::U8 => f64::from(chunk[0]),
            ArrayKind::I32 => f64::from(i32::from_le_bytes(word)),
            ArrayKind::U32 => f64::from(u32::from_le_bytes(word)),
            ArrayKind::F32 => f64::from(f32::from_le_bytes(word)),
        })
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.bytes, &other.bytes)
    }
}

/// Any other host object (a DOM node, a GPU handle, ...), kept opaque.
#[derive(Clone)]
pub struct Opaque {
    type_name: &'static str,
    value: Rc<dyn Any>,
}

impl Opaque {
    pub fn new<T: Any>(value: T) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            value: Rc::new(value),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.value, &other.value)
    }
}

/// A value owned by the host and named by a handle.
#[derive(Clone, Default)]
pub enum HostValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Array(Rc<RefCell<Vec<HostValue>>>),
    Object(Rc<RefCell<BTreeMap<String, HostValue>>>),
    TypedArray(TypedArray),
    Function(HostFunction),
    Closure(Closure),
    Error(Rc<HostException>),
    /// The guest's own linear memory object.
    Memory,
    Opaque(Opaque),
}

impl HostValue {
    pub fn string(s: &str) -> Self {
        Self::String(s.into())
    }

    pub fn array(items: Vec<HostValue>) -> Self {
        Self::Array(Rc::new(RefCell::new(items)))
    }

    pub fn object() -> Self {
        Self::Object(Rc::new(RefCell::new(BTreeMap::new())))
    }

    pub fn error(exn: HostException) -> Self {
        Self::Error(Rc::new(exn))
    }

    pub fn function(
        name: &str,
        func: impl Fn(&[HostValue]) -> Result<HostValue, HostException> + 'static,
    ) -> Self {
        Self::Function(HostFunction::new(name, func))
    }

    /// Short kind name used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "Array",
            Self::Object(_) => "Object",
            Self::TypedArray(arr) => arr.kind().name(),
            Self::Function(_) | Self::Closure(_) => "function",
            Self::Error(_) => "Error",
            Self::Memory => "Memory",
            Self::Opaque(o) => o.type_name(),
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Self::Function(_) | Self::Closure(_))
    }

    /// Non-null, non-function reference value.
    pub fn is_object(&self) -> bool {
        matches!(
            self,
            Self::Array(_)
                | Self::Object(_)
                | Self::TypedArray(_)
                | Self::Error(_)
                | Self::Memory
                | Self::Opaque(_)
        )
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&Closure> {
        match self {
            Self::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&HostException> {
        match self {
            Self::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Strict equality: primitives compare by value (`NaN` is unequal to
    /// itself), references by identity.
    pub fn strict_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Memory, Self::Memory) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => Rc::ptr_eq(a, b),
            (Self::Object(a), Self::Object(b)) => Rc::ptr_eq(a, b),
            (Self::TypedArray(a), Self::TypedArray(b)) => a.ptr_eq(b),
            (Self::Function(a), Self::Function(b)) => a.ptr_eq(b),
            (Self::Closure(a), Self::Closure(b)) => a.ptr_eq(b),
            (Self::Error(a), Self::Error(b)) => Rc::ptr_eq(a, b),
            (Self::Opaque(a), Self::Opaque(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Human-readable rendering for diagnostics.
    pub fn debug_string(&self) -> String {
        self.render(&mut Walk::default())
    }

    fn render(&self, walk: &mut Walk) -> String {
        if !walk.step() {
            return "...".to_string();
        }
        match self {
            Self::Undefined => "undefined".to_string(),
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => format_number(*n),
            Self::String(s) => format!("\"{s}\""),
            Self::Function(f) if !f.name().is_empty() => format!("Function({})", f.name()),
            Self::Function(_) | Self::Closure(_) => "Function".to_string(),
            Self::Array(items) => {
                let id = Rc::as_ptr(items).cast::<()>();
                if walk.is_on_path(id) {
                    return "[Circular]".to_string();
                }
                walk.path.push(id);
                let parts: Vec<String> = items.borrow().iter().map(|v| v.render(walk)).collect();
                walk.path.pop();
                format!("[{}]", parts.join(", "))
            }
            Self::Object(_) => {
                let shared = RefCell::new(std::mem::take(walk));
                let json = serde_json::to_string(&Json {
                    value: self,
                    walk: &shared,
                });
                *walk = shared.into_inner();
                match json {
                    Ok(json) => format!("Object({json})"),
                    Err(_) => "Object".to_string(),
                }
            }
            Self::Error(e) => format!("{}: {}", e.name, e.message),
            Self::TypedArray(arr) => arr.kind().name().to_string(),
            Self::Memory => "Memory".to_string(),
            Self::Opaque(o) => o.type_name().to_string(),
        }
    }
}

/// Numbers render without a trailing `.0` when integral.
fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        let text = if n > 0.0 { "Infinity" } else { "-Infinity" };
        text.to_string()
    } else {
        n.to_string()
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.debug_string())
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        Self::string(s)
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        Self::String(s.into())
    }
}

impl From<HostException> for HostValue {
    fn from(exn: HostException) -> Self {
        Self::error(exn)
    }
}

/// JSON rendering; non-data values become `null`, as `JSON.stringify` would.
impl Serialize for HostValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let walk = RefCell::new(Walk::default());
        Json {
            value: self,
            walk: &walk,
        }
        .serialize(serializer)
    }
}

/// State of one traversal: containers on the current path and the number of
/// values visited so far.
#[derive(Default)]
struct Walk {
    path: Vec<*const ()>,
    visited: usize,
}

impl Walk {
    /// Count one more value; `false` once the walk is too deep or too large.
    fn step(&mut self) -> bool {
        self.visited += 1;
        self.visited <= MAX_NODES && self.path.len() <= MAX_DEPTH
    }

    fn is_on_path(&self, id: *const ()) -> bool {
        self.path.contains(&id)
    }
}

struct Json<'a> {
    value: &'a HostValue,
    walk: &'a RefCell<Walk>,
}

impl Json<'_> {
    /// Serialise the children of the container `id`, refusing cycles.
    fn nested<S: Serializer>(
        &self,
        id: *const (),
        body: impl FnOnce() -> Result<S::Ok, S::Error>,
    ) -> Result<S::Ok, S::Error> {
        if self.walk.borrow().is_on_path(id) {
            return Err(S::Error::custom("cyclic value"));
        }
        self.walk.borrow_mut().path.push(id);
        let out = body();
        self.walk.borrow_mut().path.pop();
        out
    }

    fn child<'v>(&'v self, value: &'v HostValue) -> Json<'v> {
        Json {
            value,
            walk: self.walk,
        }
    }
}

impl Serialize for Json<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if !self.walk.borrow_mut().step() {
            return Err(S::Error::custom("value too large or nested too deeply"));
        }
        match self.value {
            HostValue::Bool(b) => serializer.serialize_bool(*b),
            HostValue::Number(n) if n.is_finite() => serializer.serialize_f64(*n),
            HostValue::String(s) => serializer.serialize_str(s),
            HostValue::Array(items) => self.nested::<S>(Rc::as_ptr(items).cast(), || {
                let items = items.borrow();
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for value in items.iter() {
                    seq.serialize_element(&self.child(value))?;
                }
                seq.end()
            }),
            HostValue::Object(fields) => self.nested::<S>(Rc::as_ptr(fields).cast(), || {
                let fields = fields.borrow();
                let mut map = serializer.serialize_map(Some(fields.len()))?;
                for (key, value) in fields.iter() {
                    map.serialize_entry(key, &self.child(value))?;
                }
                map.end()
            }),
            HostValue::TypedArray(arr) => {
                let mut seq = serializer.serialize_seq(Some(arr.len()))?;
                for i in 0..arr.len() {
                    seq.serialize_element(&arr.get(i))?;
                }
                seq.end()
            }
            HostValue::Error(_) => serializer.serialize_map(Some(0))?.end(),
            _ => serializer.serialize_unit(),
        }
    }
}

/// Property read on an object or array, mirroring `Reflect.get`.
pub fn reflect_get(target: &HostValue, key: &HostValue) -> Result<HostValue, HostException> {
    match target {
        HostValue::Object(fields) => {
            let key = property_key(key);
            Ok(fields.borrow().get(&key).cloned().unwrap_or_default())
        }
        HostValue::Array(items) => {
            let items = items.borrow();
            if let Some(index) = array_index(key) {
                return Ok(items.get(index).cloned().unwrap_or_default());
            }
            if property_key(key) == "length" {
                return Ok(HostValue::Number(items.len() as f64));
            }
            Ok(HostValue::Undefined)
        }
        HostValue::TypedArray(arr) => Ok(array_index(key)
            .and_then(|i| arr.get(i))
            .map_or(HostValue::Undefined, HostValue::Number)),
        HostValue::Error(e) => Ok(match property_key(key).as_str() {
            "name" => HostValue::string(&e.name),
            "message" => HostValue::string(&e.message),
            _ => HostValue::Undefined,
        }),
        other => Err(HostException::type_error(format!(
            "Reflect.get called on non-object ({})",
            other.type_name()
        ))),
    }
}

/// Property write on an object or array, mirroring `Reflect.set`.
///
/// Returns `false` when the target refuses the write.
pub fn reflect_set(
    target: &HostValue,
    key: &HostValue,
    value: HostValue,
) -> Result<bool, HostException> {
    match target {
        HostValue::Object(fields) => {
            fields.borrow_mut().insert(property_key(key), value);
            Ok(true)
        }
        HostValue::Array(items) => match array_index(key) {
            Some(index) if index > items.borrow().len() + MAX_ARRAY_GAP => Ok(false),
            Some(index) => {
                let mut items = items.borrow_mut();
                if index >= items.len() {
                    items.resize(index + 1, HostValue::Undefined);
                }
                items[index] = value;
                Ok(true)
            }
            None => Ok(false),
        },
        HostValue::TypedArray(_) | HostValue::Error(_) | HostValue::Memory | HostValue::Opaque(_) => {
            Ok(false)
        }
        other => Err(HostException::type_error(format!(
            "Reflect.set called on non-object ({})",
            other.type_name()
        ))),
    }
}

/// Property-key conversion: strings as-is, numbers in canonical form.
fn property_key(key: &HostValue) -> String {
    match key {
        HostValue::String(s) => s.to_string(),
        HostValue::Number(n) => format_number(*n),
        other => other.debug_string(),
    }
}

fn array_index(key: &HostValue) -> Option<usize> {
    match key {
        HostValue::Number(n) if *n >= 0.0 && n.fract() == 0.0 => Some(*n as usize),
        HostValue::String(s) => s.parse().ok(),
        _ => None,
    }
}

//! The intrinsic import table.
//!
//! Both sides of the boundary agree on this table: the runtime links one host
//! function per [`Intrinsic`], and the guest builder imports them in
//! [`Intrinsic::ALL`] order, so an intrinsic's position in that array is its
//! guest function index.

/// Default import module name.
pub const IMPORT_MODULE: &str = "tether";

/// Status word written by fallible intrinsics: the call succeeded.
pub const STATUS_OK: i32 = 0;
/// Status word written by fallible intrinsics: an exception is in the error slot.
pub const STATUS_THREW: i32 = 1;

/// Tri-state boolean encoding used by `boolean_get`.
pub const TRISTATE_FALSE: i32 = 0;
pub const TRISTATE_TRUE: i32 = 1;
pub const TRISTATE_UNSET: i32 = 2;

/// Element kind codes accepted by `array_from_guest`.
pub const ARRAY_U8: i32 = 0;
pub const ARRAY_I32: i32 = 1;
pub const ARRAY_U32: i32 = 2;
pub const ARRAY_F32: i32 = 3;

/// Closure kind codes accepted by `closure_new`.
pub const CLOSURE_MUT: i32 = 0;
pub const CLOSURE_SHARED: i32 = 1;

/// Value types appearing in intrinsic signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiType {
    I32,
    F64,
}

use AbiType::{F64, I32};

/// A host function imported by every guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    ObjectDropRef,
    ObjectCloneRef,
    StringNew,
    StringGet,
    NumberNew,
    NumberGet,
    BooleanGet,
    IsUndefined,
    IsNull,
    IsFunction,
    IsObject,
    IsString,
    JsvalEq,
    DebugString,
    ErrorNew,
    ErrorMessage,
    Throw,
    Memory,
    ArrayFromGuest,
    ArrayToGuest,
    ObjectNew,
    ArrayNew,
    ArrayPush,
    ReflectGet,
    ReflectSet,
    Call,
    ClosureNew,
    ClosureRetain,
    CbDrop,
    ExnTake,
}

impl Intrinsic {
    /// Every intrinsic, in guest import order.
    pub const ALL: [Intrinsic; 30] = [
        Intrinsic::ObjectDropRef,
        Intrinsic::ObjectCloneRef,
        Intrinsic::StringNew,
        Intrinsic::StringGet,
        Intrinsic::NumberNew,
        Intrinsic::NumberGet,
        Intrinsic::BooleanGet,
        Intrinsic::IsUndefined,
        Intrinsic::IsNull,
        Intrinsic::IsFunction,
        Intrinsic::IsObject,
        Intrinsic::IsString,
        Intrinsic::JsvalEq,
        Intrinsic::DebugString,
        Intrinsic::ErrorNew,
        Intrinsic::ErrorMessage,
        Intrinsic::Throw,
        Intrinsic::Memory,
        Intrinsic::ArrayFromGuest,
        Intrinsic::ArrayToGuest,
        Intrinsic::ObjectNew,
        Intrinsic::ArrayNew,
        Intrinsic::ArrayPush,
        Intrinsic::ReflectGet,
        Intrinsic::ReflectSet,
        Intrinsic::Call,
        Intrinsic::ClosureNew,
        Intrinsic::ClosureRetain,
        Intrinsic::CbDrop,
        Intrinsic::ExnTake,
    ];

    /// Import name.
    pub const fn name(self) -> &'static str {
        match self {
            Intrinsic::ObjectDropRef => "object_drop_ref",
            Intrinsic::ObjectCloneRef => "object_clone_ref",
            Intrinsic::StringNew => "string_new",
            Intrinsic::StringGet => "string_get",
            Intrinsic::NumberNew => "number_new",
            Intrinsic::NumberGet => "number_get",
            Intrinsic::BooleanGet => "boolean_get",
            Intrinsic::IsUndefined => "is_undefined",
            Intrinsic::IsNull => "is_null",
            Intrinsic::IsFunction => "is_function",
            Intrinsic::IsObject => "is_object",
            Intrinsic::IsString => "is_string",
            Intrinsic::JsvalEq => "jsval_eq",
            Intrinsic::DebugString => "debug_string",
            Intrinsic::ErrorNew => "error_new",
            Intrinsic::ErrorMessage => "error_message",
            Intrinsic::Throw => "throw",
            Intrinsic::Memory => "memory",
            Intrinsic::ArrayFromGuest => "array_from_guest",
            Intrinsic::ArrayToGuest => "array_to_guest",
            Intrinsic::ObjectNew => "object_new",
            Intrinsic::ArrayNew => "array_new",
            Intrinsic::ArrayPush => "array_push",
            Intrinsic::ReflectGet => "reflect_get",
            Intrinsic::ReflectSet => "reflect_set",
            Intrinsic::Call => "call",
            Intrinsic::ClosureNew => "closure_new",
            Intrinsic::ClosureRetain => "closure_retain",
            Intrinsic::CbDrop => "cb_drop",
            Intrinsic::ExnTake => "exn_take",
        }
    }

    /// Parameter types.
    pub const fn params(self) -> &'static [AbiType] {
        match self {
            Intrinsic::ObjectDropRef
            | Intrinsic::ObjectCloneRef
            | Intrinsic::BooleanGet
            | Intrinsic::IsUndefined
            | Intrinsic::IsNull
            | Intrinsic::IsFunction
            | Intrinsic::IsObject
            | Intrinsic::IsString
            | Intrinsic::ClosureRetain
            | Intrinsic::CbDrop => &[I32],
            Intrinsic::StringNew
            | Intrinsic::StringGet
            | Intrinsic::NumberGet
            | Intrinsic::JsvalEq
            | Intrinsic::DebugString
            | Intrinsic::ErrorNew
            | Intrinsic::ErrorMessage
            | Intrinsic::Throw
            | Intrinsic::ArrayToGuest
            | Intrinsic::ArrayPush => &[I32, I32],
            Intrinsic::NumberNew => &[F64],
            Intrinsic::Memory
            | Intrinsic::ObjectNew
            | Intrinsic::ArrayNew
            | Intrinsic::ExnTake => &[],
            Intrinsic::ArrayFromGuest | Intrinsic::ReflectGet | Intrinsic::Call => {
                &[I32, I32, I32]
            }
            Intrinsic::ReflectSet => &[I32, I32, I32, I32],
            Intrinsic::ClosureNew => &[I32, I32, I32, I32, I32],
        }
    }

    /// Result types (at most one).
    pub const fn results(self) -> &'static [AbiType] {
        match self {
            Intrinsic::ObjectDropRef
            | Intrinsic::StringGet
            | Intrinsic::NumberGet
            | Intrinsic::DebugString
            | Intrinsic::ErrorMessage
            | Intrinsic::Throw
            | Intrinsic::ClosureRetain => &[],
            _ => &[I32],
        }
    }

    /// Guest function index of this intrinsic (its position in [`Intrinsic::ALL`]).
    pub fn import_index(self) -> u32 {
        Self::ALL
            .iter()
            .position(|&i| i == self)
            .map_or(u32::MAX, |p| p as u32)
    }
}

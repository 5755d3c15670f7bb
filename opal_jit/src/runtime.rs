//! The VM-facing interface.
//!
//! The compiler consumes method descriptors and answers object-layout and
//! resolution queries through the traits here. Nothing in this module knows
//! about source-level types; classes, fields and methods are opaque
//! descriptors with just enough structure for code generation.
//!
//! [`HostRuntime`] and [`TablePool`] form a self-contained reference
//! implementation with a fixed object layout, used by the integration tests
//! and by embedders that want a working pipeline before wiring a real VM.

use std::fmt;
use std::sync::Arc;

use opal_core::{Kind, Signature};

use crate::value::{ConstValue, ObjectHandle};

/// An opaque class descriptor.
///
/// Identity is the numeric id; two `ClassInfo`s with the same id are the
/// same class regardless of how they were obtained.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    /// Internal class name, e.g. `java/lang/String`.
    pub name: String,
    /// Runtime-assigned unique id.
    pub id: u32,
    /// For array classes, the element kind.
    pub elem_kind: Option<Kind>,
}

impl PartialEq for ClassInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ClassInfo {}

impl std::hash::Hash for ClassInfo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Shared handle to a class descriptor.
pub type ClassRef = Arc<ClassInfo>;

/// A resolved field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef {
    /// Declaring class.
    pub holder: ClassRef,
    /// Field name.
    pub name: String,
    /// Storage kind.
    pub kind: Kind,
    /// Byte offset within an instance, or within the static area.
    pub offset: i32,
    pub is_static: bool,
    pub is_volatile: bool,
}

/// Method access and compilation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MethodFlags(u32);

impl MethodFlags {
    /// Static method: no receiver.
    pub const STATIC: MethodFlags = MethodFlags(0x0008);
    /// Synchronized method: implicit monitor around the body.
    pub const SYNCHRONIZED: MethodFlags = MethodFlags(0x0020);
    /// Native method: no bytecode.
    pub const NATIVE: MethodFlags = MethodFlags(0x0100);
    /// The method must not contain safepoints.
    pub const NO_SAFEPOINTS: MethodFlags = MethodFlags(0x1_0000);

    /// Create from raw bits.
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        MethodFlags(bits)
    }

    /// Combine flag sets.
    #[inline]
    pub const fn union(self, other: MethodFlags) -> Self {
        MethodFlags(self.0 | other.0)
    }

    #[inline]
    pub const fn is_static(self) -> bool {
        (self.0 & Self::STATIC.0) != 0
    }

    #[inline]
    pub const fn is_synchronized(self) -> bool {
        (self.0 & Self::SYNCHRONIZED.0) != 0
    }

    #[inline]
    pub const fn is_native(self) -> bool {
        (self.0 & Self::NATIVE.0) != 0
    }

    #[inline]
    pub const fn no_safepoints(self) -> bool {
        (self.0 & Self::NO_SAFEPOINTS.0) != 0
    }
}

/// One entry of a method's exception-handler table.
#[derive(Debug, Clone)]
pub struct ExceptionHandler {
    /// First covered bci, inclusive.
    pub start_bci: u32,
    /// End of the covered range, exclusive.
    pub end_bci: u32,
    /// Entry bci of the handler.
    pub handler_bci: u32,
    /// Caught class; `None` catches everything.
    pub catch_type: Option<ClassRef>,
}

impl ExceptionHandler {
    /// Whether the handler covers an instruction at `bci`.
    #[inline]
    pub fn covers(&self, bci: u32) -> bool {
        self.start_bci <= bci && bci < self.end_bci
    }
}

/// The code attribute of a method.
#[derive(Clone)]
pub struct MethodCode {
    /// Raw bytecode.
    pub bytecode: Vec<u8>,
    /// Declared operand-stack limit.
    pub max_stack: u16,
    /// Declared local-slot count (including parameters).
    pub max_locals: u16,
    /// Exception-handler table, in declaration order.
    pub handlers: Vec<ExceptionHandler>,
    /// The constant pool the bytecode indexes into.
    pub pool: Arc<dyn ConstantPool>,
}

impl fmt::Debug for MethodCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodCode")
            .field("bytecode_len", &self.bytecode.len())
            .field("max_stack", &self.max_stack)
            .field("max_locals", &self.max_locals)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// A method descriptor: the compile input and the callee unit of calls.
#[derive(Debug, Clone)]
pub struct Method {
    /// Internal name of the declaring class.
    pub holder: String,
    /// Method name.
    pub name: String,
    /// Parsed signature.
    pub signature: Signature,
    pub flags: MethodFlags,
    /// Code attribute; absent for native and abstract methods.
    pub code: Option<MethodCode>,
}

/// Shared handle to a method descriptor.
pub type MethodRef = Arc<Method>;

impl Method {
    /// Create a code-less descriptor.
    pub fn new(
        holder: impl Into<String>,
        name: impl Into<String>,
        signature: Signature,
        flags: MethodFlags,
    ) -> Method {
        Method {
            holder: holder.into(),
            name: name.into(),
            signature,
            flags,
            code: None,
        }
    }

    /// Attach a code attribute.
    #[must_use]
    pub fn with_code(mut self, code: MethodCode) -> Method {
        self.code = Some(code);
        self
    }

    /// Whether calls to this method pass a receiver.
    #[inline]
    pub fn has_receiver(&self) -> bool {
        !self.flags.is_static()
    }

    /// Argument kinds at a call site, receiver included where applicable.
    pub fn argument_kinds(&self) -> Vec<Kind> {
        self.signature.argument_kinds(self.has_receiver())
    }

    /// `holder.name(descriptor)` for diagnostics and print filtering.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}{}", self.holder, self.name, self.signature)
    }
}

/// Invocation profile for a method, when the runtime has one.
#[derive(Debug, Clone, Copy)]
pub struct MethodProfile {
    /// How many times the method has been invoked.
    pub invocation_count: u32,
}

/// Resolution interface over a constant pool.
///
/// `None` means the entry is present but unresolved; callers either bail
/// out or take the patching path depending on configuration.
pub trait ConstantPool: Send + Sync {
    /// A loadable constant (`ldc` family).
    fn constant_at(&self, index: u16) -> Option<ConstValue>;
    /// A class entry (`new`, `checkcast`, `instanceof`, `anewarray`, …).
    fn class_at(&self, index: u16) -> Option<ClassRef>;
    /// A field entry (`getfield`/`putfield`/`getstatic`/`putstatic`).
    fn field_at(&self, index: u16) -> Option<FieldRef>;
    /// A method entry (`invoke*`).
    fn method_at(&self, index: u16) -> Option<MethodRef>;
}

/// Object-layout and profiling queries the compiler needs from its VM.
pub trait RuntimeInterface: Send + Sync {
    /// Byte offset of the hub (type descriptor) word in every object.
    fn hub_offset(&self) -> i32;
    /// Byte offset of the length field in array objects.
    fn array_length_offset(&self) -> i32;
    /// Byte offset of the first element of an array with this element kind.
    fn array_base_offset(&self, elem: Kind) -> i32;
    /// The class mirror object for a class (static synchronization, `ldc`).
    fn class_mirror(&self, class: &ClassRef) -> ConstValue;
    /// Byte offset of a method's dispatch-table entry within its holder's
    /// hub, for vtable/itable calls.
    fn dispatch_entry_offset(&self, method: &Method) -> i32;
    /// Invocation profile, when available.
    fn profile(&self, method: &Method) -> Option<MethodProfile>;
}

// =============================================================================
// Host reference implementation
// =============================================================================

/// A self-contained [`RuntimeInterface`] with a fixed object layout:
/// hub at offset 0, array length at offset 8, elements from offset 16.
#[derive(Debug, Default)]
pub struct HostRuntime;

impl RuntimeInterface for HostRuntime {
    fn hub_offset(&self) -> i32 {
        0
    }

    fn array_length_offset(&self) -> i32 {
        8
    }

    fn array_base_offset(&self, _elem: Kind) -> i32 {
        16
    }

    fn class_mirror(&self, class: &ClassRef) -> ConstValue {
        ConstValue::Object(ObjectHandle(0x4000_0000 | u64::from(class.id)))
    }

    fn dispatch_entry_offset(&self, method: &Method) -> i32 {
        // A stable word-aligned slot derived from the method's name and
        // descriptor.
        let mut hash: u32 = 5381;
        for b in method.name.bytes().chain(method.signature.descriptor().bytes()) {
            hash = hash.wrapping_mul(33) ^ u32::from(b);
        }
        64 + ((hash % 512) as i32) * 8
    }

    fn profile(&self, _method: &Method) -> Option<MethodProfile> {
        None
    }
}

/// A constant pool backed by index tables, for tests and embedders without
/// a classfile reader.
#[derive(Default)]
pub struct TablePool {
    constants: Vec<Option<ConstValue>>,
    classes: Vec<Option<ClassRef>>,
    fields: Vec<Option<FieldRef>>,
    methods: Vec<Option<MethodRef>>,
}

impl TablePool {
    /// An empty pool; every lookup reports unresolved.
    pub fn new() -> TablePool {
        TablePool::default()
    }

    /// Install a loadable constant at an index.
    pub fn set_constant(&mut self, index: u16, value: ConstValue) {
        grow_set(&mut self.constants, index, value);
    }

    /// Install a class entry at an index.
    pub fn set_class(&mut self, index: u16, class: ClassRef) {
        grow_set(&mut self.classes, index, class);
    }

    /// Install a field entry at an index.
    pub fn set_field(&mut self, index: u16, field: FieldRef) {
        grow_set(&mut self.fields, index, field);
    }

    /// Install a method entry at an index.
    pub fn set_method(&mut self, index: u16, method: MethodRef) {
        grow_set(&mut self.methods, index, method);
    }
}

fn grow_set<T>(table: &mut Vec<Option<T>>, index: u16, value: T) {
    let index = index as usize;
    if table.len() <= index {
        table.resize_with(index + 1, || None);
    }
    table[index] = Some(value);
}

impl ConstantPool for TablePool {
    fn constant_at(&self, index: u16) -> Option<ConstValue> {
        self.constants.get(index as usize).cloned().flatten()
    }

    fn class_at(&self, index: u16) -> Option<ClassRef> {
        self.classes.get(index as usize).cloned().flatten()
    }

    fn field_at(&self, index: u16) -> Option<FieldRef> {
        self.fields.get(index as usize).cloned().flatten()
    }

    fn method_at(&self, index: u16) -> Option<MethodRef> {
        self.methods.get(index as usize).cloned().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(name: &str, id: u32) -> ClassRef {
        Arc::new(ClassInfo {
            name: name.to_string(),
            id,
            elem_kind: None,
        })
    }

    #[test]
    fn test_class_identity_is_by_id() {
        let a = class("Foo", 7);
        let b = class("Foo (renamed)", 7);
        let c = class("Foo", 8);
        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
    }

    #[test]
    fn test_method_flags() {
        let flags = MethodFlags::STATIC.union(MethodFlags::SYNCHRONIZED);
        assert!(flags.is_static());
        assert!(flags.is_synchronized());
        assert!(!flags.is_native());
        assert!(!flags.no_safepoints());
    }

    #[test]
    fn test_method_argument_kinds_include_receiver() {
        let sig = Signature::parse("(I)V").unwrap();
        let virtual_m = Method::new("Foo", "bar", sig.clone(), MethodFlags::default());
        let static_m = Method::new("Foo", "baz", sig, MethodFlags::STATIC);
        assert_eq!(virtual_m.argument_kinds(), vec![Kind::Object, Kind::Int]);
        assert_eq!(static_m.argument_kinds(), vec![Kind::Int]);
    }

    #[test]
    fn test_handler_coverage_is_half_open() {
        let h = ExceptionHandler {
            start_bci: 4,
            end_bci: 10,
            handler_bci: 20,
            catch_type: None,
        };
        assert!(!h.covers(3));
        assert!(h.covers(4));
        assert!(h.covers(9));
        assert!(!h.covers(10));
    }

    #[test]
    fn test_table_pool_lookup() {
        let mut pool = TablePool::new();
        pool.set_constant(3, ConstValue::Int(42));
        pool.set_class(1, class("Foo", 1));
        assert_eq!(pool.constant_at(3), Some(ConstValue::Int(42)));
        assert!(pool.constant_at(2).is_none());
        assert!(pool.class_at(1).is_some());
        assert!(pool.field_at(0).is_none());
        assert!(pool.method_at(9).is_none());
    }

    #[test]
    fn test_host_runtime_layout() {
        let rt = HostRuntime;
        assert_eq!(rt.hub_offset(), 0);
        assert_eq!(rt.array_length_offset(), 8);
        assert_eq!(rt.array_base_offset(Kind::Int), 16);
        let c = class("Foo", 5);
        assert!(matches!(rt.class_mirror(&c), ConstValue::Object(_)));
    }

    #[test]
    fn test_qualified_name_format() {
        let sig = Signature::parse("(IJ)V").unwrap();
        let m = Method::new("com/x/Foo", "bar", sig, MethodFlags::STATIC);
        assert_eq!(m.qualified_name(), "com/x/Foo.bar(IJ)V");
    }
}

//! XIR: parameterised inline code templates.
//!
//! XIR is a small target-independent micro-assembly the runtime supplies to
//! the compiler for object operations: allocation, field access, type
//! tests, monitors, barriers, safepoints. A [`XirTemplate`] declares its
//! operands (inputs, input-temps, temps, an optional result, constants), a
//! fast-path instruction list, an optional out-of-line slow path, and named
//! marks the emitter reports back as call-site metadata. A [`XirSnippet`]
//! binds a template to concrete arguments at one site.
//!
//! The compiler's obligations when weaving a snippet in are operand
//! allocation for every template variable (honoring fixed registers),
//! copying input-temps so the caller's value survives the template's
//! writes, and routing the template's runtime calls through the stop-
//! position tables.

use std::sync::Arc;

use opal_core::Kind;

use crate::hir::InstrId;
use crate::hir::{Cond, IntrinsicId};
use crate::lir::RuntimeCall;
use crate::runtime::{ClassRef, FieldRef, Method, RuntimeInterface};
use crate::target::registers::Reg;
use crate::value::ConstValue;

/// A label inside a template; shared between fast and slow path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XirLabel(pub u32);

/// Role of a template operand.
#[derive(Debug, Clone, PartialEq)]
pub enum XirRole {
    /// Read-only input bound to a snippet argument.
    Input,
    /// Input the template writes through; the compiler copies it into a
    /// fresh variable first so the argument value survives.
    InputTemp,
    /// Scratch variable owned by the template.
    Temp,
    /// The produced value.
    Result,
    /// A compile-time constant baked into the template.
    Constant(ConstValue),
}

/// One declared operand of a template.
#[derive(Debug, Clone, PartialEq)]
pub struct XirOperandDef {
    pub name: &'static str,
    pub kind: Kind,
    pub role: XirRole,
    /// Pre-assigned register; registered as a fixed constraint.
    pub fixed: Option<Reg>,
}

/// A named position inside a template, reported as call-site metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct XirMark {
    pub name: &'static str,
    pub label: XirLabel,
}

/// Template instructions. Operands are indices into the template's operand
/// list.
#[derive(Debug, Clone, PartialEq)]
pub enum XirOp {
    Mov { dst: usize, src: usize },
    Add { dst: usize, a: usize, b: usize },
    Sub { dst: usize, a: usize, b: usize },
    And { dst: usize, a: usize, b: usize },
    Or { dst: usize, a: usize, b: usize },
    Xor { dst: usize, a: usize, b: usize },
    Shl { dst: usize, a: usize, b: usize },
    /// Logical right shift.
    Shr { dst: usize, a: usize, b: usize },
    /// `dst <- [base + disp]` of the given kind.
    PointerLoad {
        dst: usize,
        base: usize,
        disp: i32,
        kind: Kind,
        /// Whether a trap here must carry the site's debug info.
        can_trap: bool,
    },
    /// `[base + disp] <- src`.
    PointerStore {
        base: usize,
        disp: i32,
        src: usize,
        kind: Kind,
        can_trap: bool,
    },
    /// `dst <- [base + index*scale + disp]`.
    PointerLoadIndexed {
        dst: usize,
        base: usize,
        index: usize,
        scale: u8,
        disp: i32,
        kind: Kind,
    },
    /// `[base + index*scale + disp] <- src`.
    PointerStoreIndexed {
        base: usize,
        index: usize,
        scale: u8,
        disp: i32,
        src: usize,
        kind: Kind,
    },
    /// Compare-and-branch.
    Jcc {
        cond: Cond,
        a: usize,
        b: usize,
        target: XirLabel,
    },
    Jmp { target: XirLabel },
    Bind { label: XirLabel },
    /// Call into the runtime; the result operand, if any, receives the
    /// call's return value.
    CallRuntime {
        call: RuntimeCall,
        args: Vec<usize>,
        result: Option<usize>,
    },
    /// A safepoint poll.
    Safepoint,
    /// Record the named mark at the current position.
    Mark { mark: usize },
    /// Unreachable; emits a trap instruction.
    ShouldNotReachHere,
}

/// A parameterised code template.
#[derive(Debug, Clone, PartialEq)]
pub struct XirTemplate {
    pub name: &'static str,
    pub operands: Vec<XirOperandDef>,
    /// Index of the `Result` operand, if the template produces a value.
    pub result: Option<usize>,
    pub fast_path: Vec<XirOp>,
    /// Out-of-line continuation, emitted after the method body.
    pub slow_path: Vec<XirOp>,
    pub marks: Vec<XirMark>,
    label_count: u32,
}

impl XirTemplate {
    /// Operand indices that snippet arguments bind to, in declaration
    /// order (`Input` and `InputTemp` operands).
    pub fn parameter_indices(&self) -> Vec<usize> {
        self.operands
            .iter()
            .enumerate()
            .filter(|(_, def)| matches!(def.role, XirRole::Input | XirRole::InputTemp))
            .map(|(i, _)| i)
            .collect()
    }

    /// Whether the operand at `index` is written by the template.
    pub fn is_def(&self, index: usize) -> bool {
        matches!(
            self.operands.get(index).map(|d| &d.role),
            Some(XirRole::InputTemp | XirRole::Temp | XirRole::Result)
        )
    }

    /// Number of labels the template declares.
    #[inline]
    pub fn label_count(&self) -> u32 {
        self.label_count
    }

    /// Whether the template has an out-of-line slow path.
    #[inline]
    pub fn has_slow_path(&self) -> bool {
        !self.slow_path.is_empty()
    }
}

/// An argument bound to a template parameter at a site.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum XirArgument {
    Constant(ConstValue),
    /// A HIR value; the LIR generator resolves it to an operand.
    Value(InstrId),
}

/// A template applied at one site.
#[derive(Debug, Clone, PartialEq)]
pub struct XirSnippet {
    pub template: Arc<XirTemplate>,
    /// One argument per template parameter, in parameter order.
    pub args: Vec<XirArgument>,
}

impl XirSnippet {
    /// Bind a template to site arguments.
    ///
    /// Panics if the argument count does not match the template's
    /// parameter count; templates and their call sites are compiled-in
    /// pairs, so a mismatch is a bug, not an input error.
    pub fn new(template: Arc<XirTemplate>, args: Vec<XirArgument>) -> XirSnippet {
        assert_eq!(
            template.parameter_indices().len(),
            args.len(),
            "snippet for {} expects {} arguments, got {}",
            template.name,
            template.parameter_indices().len(),
            args.len()
        );
        XirSnippet { template, args }
    }
}

/// Builder for templates.
pub struct XirTemplateBuilder {
    name: &'static str,
    operands: Vec<XirOperandDef>,
    result: Option<usize>,
    fast_path: Vec<XirOp>,
    slow_path: Vec<XirOp>,
    marks: Vec<XirMark>,
    labels: u32,
    in_slow_path: bool,
}

impl XirTemplateBuilder {
    /// Start a template.
    pub fn new(name: &'static str) -> XirTemplateBuilder {
        XirTemplateBuilder {
            name,
            operands: Vec::new(),
            result: None,
            fast_path: Vec::new(),
            slow_path: Vec::new(),
            marks: Vec::new(),
            labels: 0,
            in_slow_path: false,
        }
    }

    fn operand(&mut self, def: XirOperandDef) -> usize {
        self.operands.push(def);
        self.operands.len() - 1
    }

    /// Declare a read-only input parameter.
    pub fn input(&mut self, name: &'static str, kind: Kind) -> usize {
        self.operand(XirOperandDef {
            name,
            kind,
            role: XirRole::Input,
            fixed: None,
        })
    }

    /// Declare an input the template clobbers.
    pub fn input_temp(&mut self, name: &'static str, kind: Kind) -> usize {
        self.operand(XirOperandDef {
            name,
            kind,
            role: XirRole::InputTemp,
            fixed: None,
        })
    }

    /// Declare a scratch operand.
    pub fn temp(&mut self, name: &'static str, kind: Kind) -> usize {
        self.operand(XirOperandDef {
            name,
            kind,
            role: XirRole::Temp,
            fixed: None,
        })
    }

    /// Declare a scratch operand pinned to a register.
    pub fn fixed_temp(&mut self, name: &'static str, kind: Kind, reg: Reg) -> usize {
        self.operand(XirOperandDef {
            name,
            kind,
            role: XirRole::Temp,
            fixed: Some(reg),
        })
    }

    /// Declare the result operand.
    pub fn result(&mut self, kind: Kind) -> usize {
        assert!(self.result.is_none(), "template already has a result");
        let index = self.operand(XirOperandDef {
            name: "result",
            kind,
            role: XirRole::Result,
            fixed: None,
        });
        self.result = Some(index);
        index
    }

    /// Declare an embedded constant.
    pub fn constant(&mut self, name: &'static str, value: ConstValue) -> usize {
        self.operand(XirOperandDef {
            name,
            kind: value.kind(),
            role: XirRole::Constant(value),
            fixed: None,
        })
    }

    /// Allocate a label.
    pub fn label(&mut self) -> XirLabel {
        let l = XirLabel(self.labels);
        self.labels += 1;
        l
    }

    /// Declare a named mark bound to a fresh label.
    pub fn mark(&mut self, name: &'static str) -> usize {
        let label = self.label();
        self.marks.push(XirMark { name, label });
        self.marks.len() - 1
    }

    /// Switch emission to the slow path.
    pub fn begin_slow_path(&mut self) {
        self.in_slow_path = true;
    }

    /// Append an instruction to the current path.
    pub fn emit(&mut self, op: XirOp) {
        if self.in_slow_path {
            self.slow_path.push(op);
        } else {
            self.fast_path.push(op);
        }
    }

    /// Finish, validating that every jumped-to label is bound exactly once.
    pub fn finish(self) -> XirTemplate {
        let mut bound = vec![0u32; self.labels as usize];
        for op in self.fast_path.iter().chain(self.slow_path.iter()) {
            if let XirOp::Bind { label } = op {
                bound[label.0 as usize] += 1;
            }
        }
        for op in self.fast_path.iter().chain(self.slow_path.iter()) {
            match op {
                XirOp::Jcc { target, .. } | XirOp::Jmp { target } => {
                    assert_eq!(
                        bound[target.0 as usize], 1,
                        "template {}: label {:?} bound {} times",
                        self.name, target, bound[target.0 as usize]
                    );
                }
                _ => {}
            }
        }
        XirTemplate {
            name: self.name,
            operands: self.operands,
            result: self.result,
            fast_path: self.fast_path,
            slow_path: self.slow_path,
            marks: self.marks,
            label_count: self.labels,
        }
    }
}

/// The runtime-supplied template generators the compiler queries per site.
///
/// `None` means the runtime has no template for the operation and the
/// compiler uses its built-in lowering.
#[allow(unused_variables)]
pub trait XirRuntime: Send + Sync {
    fn gen_prologue(&self, method: &Method) -> Option<XirSnippet> {
        None
    }
    fn gen_epilogue(&self, method: &Method) -> Option<XirSnippet> {
        None
    }
    fn gen_safepoint(&self) -> Option<XirSnippet> {
        None
    }
    fn gen_array_length(&self, array: XirArgument) -> Option<XirSnippet> {
        None
    }
    fn gen_array_load(&self, array: XirArgument, index: XirArgument, elem: Kind) -> Option<XirSnippet> {
        None
    }
    fn gen_array_store(
        &self,
        array: XirArgument,
        index: XirArgument,
        value: XirArgument,
        elem: Kind,
    ) -> Option<XirSnippet> {
        None
    }
    fn gen_get_field(&self, obj: XirArgument, field: &FieldRef) -> Option<XirSnippet> {
        None
    }
    fn gen_put_field(
        &self,
        obj: XirArgument,
        value: XirArgument,
        field: &FieldRef,
    ) -> Option<XirSnippet> {
        None
    }
    fn gen_get_static(&self, field: &FieldRef) -> Option<XirSnippet> {
        None
    }
    fn gen_put_static(&self, value: XirArgument, field: &FieldRef) -> Option<XirSnippet> {
        None
    }
    fn gen_check_cast(&self, obj: XirArgument, class: &ClassRef) -> Option<XirSnippet> {
        None
    }
    fn gen_instance_of(&self, obj: XirArgument, class: &ClassRef) -> Option<XirSnippet> {
        None
    }
    fn gen_monitor_enter(&self, obj: XirArgument) -> Option<XirSnippet> {
        None
    }
    fn gen_monitor_exit(&self, obj: XirArgument) -> Option<XirSnippet> {
        None
    }
    fn gen_new_instance(&self, class: &ClassRef) -> Option<XirSnippet> {
        None
    }
    fn gen_new_array(&self, length: XirArgument, elem: Kind, class: Option<&ClassRef>) -> Option<XirSnippet> {
        None
    }
    fn gen_new_multi_array(&self, dims: &[XirArgument], class: &ClassRef) -> Option<XirSnippet> {
        None
    }
    fn gen_resolve_class(&self, name: &str) -> Option<XirSnippet> {
        None
    }
    fn gen_exception_object(&self) -> Option<XirSnippet> {
        None
    }
    fn gen_invoke_static(&self, target: &Method) -> Option<XirSnippet> {
        None
    }
    fn gen_invoke_special(&self, receiver: XirArgument, target: &Method) -> Option<XirSnippet> {
        None
    }
    fn gen_invoke_virtual(&self, receiver: XirArgument, target: &Method) -> Option<XirSnippet> {
        None
    }
    fn gen_invoke_interface(&self, receiver: XirArgument, target: &Method) -> Option<XirSnippet> {
        None
    }
    fn gen_intrinsic(&self, id: IntrinsicId, args: &[XirArgument]) -> Option<XirSnippet> {
        None
    }
    fn gen_write_barrier(&self, addr: XirArgument) -> Option<XirSnippet> {
        None
    }
}

// =============================================================================
// Generic implementation over a RuntimeInterface layout
// =============================================================================

/// Card table shift used by the generic post-write barrier.
const CARD_SHIFT: i32 = 9;

/// A self-contained [`XirRuntime`] built on the object layout a
/// [`RuntimeInterface`] reports. Field accesses and array length lower to
/// direct pointer operations; allocation, monitors and type tests lower to
/// runtime calls; reference stores get a card-mark post barrier.
pub struct GenericXir {
    runtime: Arc<dyn RuntimeInterface>,
    /// Base address of the card table, as an opaque word.
    card_table_base: u64,
    field_templates: FieldTemplates,
}

struct FieldTemplates {
    array_length: Arc<XirTemplate>,
    safepoint: Arc<XirTemplate>,
    write_barrier: Arc<XirTemplate>,
}

impl GenericXir {
    /// Build over a runtime's layout, with the card table at an opaque
    /// base address.
    pub fn new(runtime: Arc<dyn RuntimeInterface>, card_table_base: u64) -> GenericXir {
        let array_length = {
            let mut b = XirTemplateBuilder::new("arrayLength");
            let array = b.input("array", Kind::Object);
            let result = b.result(Kind::Int);
            let length_offset = runtime.array_length_offset();
            b.emit(XirOp::PointerLoad {
                dst: result,
                base: array,
                disp: length_offset,
                kind: Kind::Int,
                can_trap: true,
            });
            Arc::new(b.finish())
        };
        let safepoint = {
            let mut b = XirTemplateBuilder::new("safepoint");
            b.emit(XirOp::Safepoint);
            Arc::new(b.finish())
        };
        let write_barrier = {
            let mut b = XirTemplateBuilder::new("writeBarrier");
            let addr = b.input_temp("addr", Kind::Word);
            let base = b.constant("cardTable", ConstValue::Word(card_table_base));
            let shift = b.constant("cardShift", ConstValue::Int(CARD_SHIFT));
            let zero = b.constant("dirty", ConstValue::Int(0));
            b.emit(XirOp::Shr {
                dst: addr,
                a: addr,
                b: shift,
            });
            b.emit(XirOp::PointerStoreIndexed {
                base,
                index: addr,
                scale: 1,
                disp: 0,
                src: zero,
                kind: Kind::Byte,
            });
            Arc::new(b.finish())
        };
        GenericXir {
            runtime,
            card_table_base,
            field_templates: FieldTemplates {
                array_length,
                safepoint,
                write_barrier,
            },
        }
    }

    /// The card table base this instance marks into.
    pub fn card_table_base(&self) -> u64 {
        self.card_table_base
    }

    fn field_access(&self, field: &FieldRef, store: bool) -> Arc<XirTemplate> {
        let mut b = XirTemplateBuilder::new(if store { "putField" } else { "getField" });
        let obj = b.input("object", Kind::Object);
        if store {
            let value = b.input("value", field.kind);
            b.emit(XirOp::PointerStore {
                base: obj,
                disp: field.offset,
                src: value,
                kind: field.kind,
                can_trap: !field.is_static,
            });
        } else {
            let result = b.result(field.kind.stack_kind());
            b.emit(XirOp::PointerLoad {
                dst: result,
                base: obj,
                disp: field.offset,
                kind: field.kind,
                can_trap: !field.is_static,
            });
        }
        Arc::new(b.finish())
    }

    fn runtime_call_template(
        &self,
        name: &'static str,
        call: RuntimeCall,
        inputs: &[(&'static str, Kind)],
        result: Option<Kind>,
    ) -> Arc<XirTemplate> {
        let mut b = XirTemplateBuilder::new(name);
        let args: Vec<usize> = inputs.iter().map(|(n, k)| b.input(n, *k)).collect();
        let result = result.map(|k| b.result(k));
        b.emit(XirOp::CallRuntime { call, args, result });
        Arc::new(b.finish())
    }
}

impl XirRuntime for GenericXir {
    fn gen_safepoint(&self) -> Option<XirSnippet> {
        Some(XirSnippet::new(
            Arc::clone(&self.field_templates.safepoint),
            vec![],
        ))
    }

    fn gen_array_length(&self, array: XirArgument) -> Option<XirSnippet> {
        Some(XirSnippet::new(
            Arc::clone(&self.field_templates.array_length),
            vec![array],
        ))
    }

    fn gen_get_field(&self, obj: XirArgument, field: &FieldRef) -> Option<XirSnippet> {
        Some(XirSnippet::new(self.field_access(field, false), vec![obj]))
    }

    fn gen_put_field(
        &self,
        obj: XirArgument,
        value: XirArgument,
        field: &FieldRef,
    ) -> Option<XirSnippet> {
        Some(XirSnippet::new(
            self.field_access(field, true),
            vec![obj, value],
        ))
    }

    fn gen_get_static(&self, field: &FieldRef) -> Option<XirSnippet> {
        let statics = self.runtime.class_mirror(&field.holder);
        let mut b = XirTemplateBuilder::new("getStatic");
        let holder = b.constant("statics", statics);
        let result = b.result(field.kind.stack_kind());
        b.emit(XirOp::PointerLoad {
            dst: result,
            base: holder,
            disp: field.offset,
            kind: field.kind,
            can_trap: false,
        });
        Some(XirSnippet::new(Arc::new(b.finish()), vec![]))
    }

    fn gen_put_static(&self, value: XirArgument, field: &FieldRef) -> Option<XirSnippet> {
        let statics = self.runtime.class_mirror(&field.holder);
        let mut b = XirTemplateBuilder::new("putStatic");
        let holder = b.constant("statics", statics);
        let v = b.input("value", field.kind);
        b.emit(XirOp::PointerStore {
            base: holder,
            disp: field.offset,
            src: v,
            kind: field.kind,
            can_trap: false,
        });
        Some(XirSnippet::new(Arc::new(b.finish()), vec![value]))
    }

    fn gen_check_cast(&self, obj: XirArgument, class: &ClassRef) -> Option<XirSnippet> {
        let mirror = self.runtime.class_mirror(class);
        let mut b = XirTemplateBuilder::new("checkCast");
        let o = b.input("object", Kind::Object);
        let c = b.constant("class", mirror);
        let result = b.result(Kind::Object);
        b.emit(XirOp::CallRuntime {
            call: RuntimeCall::CheckCast,
            args: vec![o, c],
            result: Some(result),
        });
        Some(XirSnippet::new(Arc::new(b.finish()), vec![obj]))
    }

    fn gen_instance_of(&self, obj: XirArgument, class: &ClassRef) -> Option<XirSnippet> {
        let mirror = self.runtime.class_mirror(class);
        let mut b = XirTemplateBuilder::new("instanceOf");
        let o = b.input("object", Kind::Object);
        let c = b.constant("class", mirror);
        let result = b.result(Kind::Int);
        b.emit(XirOp::CallRuntime {
            call: RuntimeCall::InstanceOf,
            args: vec![o, c],
            result: Some(result),
        });
        Some(XirSnippet::new(Arc::new(b.finish()), vec![obj]))
    }

    fn gen_monitor_enter(&self, obj: XirArgument) -> Option<XirSnippet> {
        let template = self.runtime_call_template(
            "monitorEnter",
            RuntimeCall::MonitorEnter,
            &[("object", Kind::Object)],
            None,
        );
        Some(XirSnippet::new(template, vec![obj]))
    }

    fn gen_monitor_exit(&self, obj: XirArgument) -> Option<XirSnippet> {
        let template = self.runtime_call_template(
            "monitorExit",
            RuntimeCall::MonitorExit,
            &[("object", Kind::Object)],
            None,
        );
        Some(XirSnippet::new(template, vec![obj]))
    }

    fn gen_new_instance(&self, class: &ClassRef) -> Option<XirSnippet> {
        let mirror = self.runtime.class_mirror(class);
        let mut b = XirTemplateBuilder::new("newInstance");
        let c = b.constant("class", mirror);
        let result = b.result(Kind::Object);
        b.emit(XirOp::CallRuntime {
            call: RuntimeCall::NewInstance,
            args: vec![c],
            result: Some(result),
        });
        Some(XirSnippet::new(Arc::new(b.finish()), vec![]))
    }

    fn gen_new_array(
        &self,
        length: XirArgument,
        elem: Kind,
        class: Option<&ClassRef>,
    ) -> Option<XirSnippet> {
        let class_const = match class {
            Some(c) => self.runtime.class_mirror(c),
            None => ConstValue::Int(elem.descriptor_char() as i32),
        };
        let mut b = XirTemplateBuilder::new("newArray");
        let len = b.input("length", Kind::Int);
        let c = b.constant("class", class_const);
        let result = b.result(Kind::Object);
        b.emit(XirOp::CallRuntime {
            call: RuntimeCall::NewArray,
            args: vec![c, len],
            result: Some(result),
        });
        Some(XirSnippet::new(Arc::new(b.finish()), vec![length]))
    }

    fn gen_write_barrier(&self, addr: XirArgument) -> Option<XirSnippet> {
        Some(XirSnippet::new(
            Arc::clone(&self.field_templates.write_barrier),
            vec![addr],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ClassInfo, HostRuntime};

    fn generic() -> GenericXir {
        GenericXir::new(Arc::new(HostRuntime), 0x7f00_0000_0000)
    }

    fn class(name: &str, id: u32) -> ClassRef {
        Arc::new(ClassInfo {
            name: name.to_string(),
            id,
            elem_kind: None,
        })
    }

    #[test]
    fn test_builder_roles_and_result() {
        let mut b = XirTemplateBuilder::new("t");
        let i = b.input("a", Kind::Int);
        let it = b.input_temp("b", Kind::Int);
        let t = b.temp("c", Kind::Int);
        let r = b.result(Kind::Int);
        let template = b.finish();
        assert_eq!(template.parameter_indices(), vec![i, it]);
        assert!(!template.is_def(i));
        assert!(template.is_def(it));
        assert!(template.is_def(t));
        assert!(template.is_def(r));
        assert_eq!(template.result, Some(r));
    }

    #[test]
    #[should_panic(expected = "bound 0 times")]
    fn test_unbound_label_rejected() {
        let mut b = XirTemplateBuilder::new("t");
        let l = b.label();
        b.emit(XirOp::Jmp { target: l });
        b.finish();
    }

    #[test]
    fn test_slow_path_binding_accepted() {
        let mut b = XirTemplateBuilder::new("t");
        let a = b.input("a", Kind::Int);
        let slow = b.label();
        let done = b.label();
        b.emit(XirOp::Jcc {
            cond: Cond::Eq,
            a,
            b: a,
            target: slow,
        });
        b.emit(XirOp::Bind { label: done });
        b.begin_slow_path();
        b.emit(XirOp::Bind { label: slow });
        b.emit(XirOp::Jmp { target: done });
        let template = b.finish();
        assert!(template.has_slow_path());
    }

    #[test]
    #[should_panic(expected = "expects 1 arguments")]
    fn test_snippet_arity_checked() {
        let xir = generic();
        let snippet = xir.gen_array_length(XirArgument::Value(InstrId(0))).unwrap();
        // Rebinding the same template with too few args must panic.
        XirSnippet::new(snippet.template, vec![]);
    }

    #[test]
    fn test_generic_field_access_uses_offsets() {
        let xir = generic();
        let field = FieldRef {
            holder: class("Foo", 1),
            name: "x".to_string(),
            kind: Kind::Int,
            offset: 24,
            is_static: false,
            is_volatile: false,
        };
        let snippet = xir
            .gen_get_field(XirArgument::Value(InstrId(3)), &field)
            .unwrap();
        match &snippet.template.fast_path[0] {
            XirOp::PointerLoad { disp, kind, can_trap, .. } => {
                assert_eq!(*disp, 24);
                assert_eq!(*kind, Kind::Int);
                assert!(*can_trap);
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn test_generic_write_barrier_marks_card() {
        let xir = generic();
        let snippet = xir.gen_write_barrier(XirArgument::Value(InstrId(0))).unwrap();
        let template = &snippet.template;
        // addr is an input-temp: the site's value must survive the shift.
        let params = template.parameter_indices();
        assert_eq!(params.len(), 1);
        assert!(template.is_def(params[0]));
        assert!(matches!(
            template.fast_path[1],
            XirOp::PointerStoreIndexed { kind: Kind::Byte, .. }
        ));
    }

    #[test]
    fn test_generic_allocation_is_runtime_call() {
        let xir = generic();
        let snippet = xir.gen_new_instance(&class("Foo", 2)).unwrap();
        assert!(matches!(
            snippet.template.fast_path[0],
            XirOp::CallRuntime {
                call: RuntimeCall::NewInstance,
                ..
            }
        ));
        assert!(snippet.template.result.is_some());
    }
}

//! Primitive implementations and the rule registry.
//!
//! Every primitive has a [`PrimitiveImpl`] giving its abstract evaluation and
//! its concrete evaluation. Transformation-specific behavior (custom partial
//! evaluation, DCE, forwarding, constant folding) is looked up in side tables
//! keyed by [`Primitive`]. All of it lives on a [`Registry`], which is passed
//! explicitly to every trace and transformation.

use crate::trace::cache::TransformCache;
use crate::trace::effects::{has_effects_for_partial_eval, Effect, Effects};
use crate::trace::interpreter::eval_jaxpr;
use crate::trace::partial_eval::{CustomSplit, SavePolicy};
use crate::trace::{dce, forwarding, partial_eval, AbstractValue, Equation, Graph, Params, Primitive};
use crate::{Array, ArrayRef, Config, DType, Dim, Error, Result, Shape, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Abstract and concrete semantics of a primitive.
pub trait PrimitiveImpl: Send + Sync {
    /// Result types and effects for operands of the given types.
    ///
    /// Input effects index into the operand list.
    fn abstract_eval(
        &self,
        prim: &Primitive,
        avals: &[AbstractValue],
        params: &Params,
    ) -> Result<(Vec<AbstractValue>, Effects)>;

    /// Apply the primitive to concrete values.
    fn eval(&self, registry: &Registry, prim: &Primitive, args: &[Value], params: &Params) -> Result<Vec<Value>>;

    /// Whether the primitive returns a list of results rather than exactly one.
    fn multiple_results(&self) -> bool {
        false
    }

    /// Effectful applications are always staged, even on known operands.
    fn is_effectful(&self, _params: &Params) -> bool {
        false
    }
}

/// Custom partial evaluation rule used by the graph splitter.
///
/// Arguments are the save policy, per-operand unknown flags, per-operand
/// instantiated flags and the equation.
pub type PartialEvalRule = fn(&Registry, &SavePolicy, &[bool], &[bool], &Equation) -> Result<CustomSplit>;

/// Custom DCE rule: given which outputs are used, returns which operands are
/// used and the replacement equation, or `None` to delete it.
pub type DceRule = fn(&Registry, &[bool], &Equation) -> Result<(Vec<bool>, Option<Equation>)>;

/// Forwarding rule: for each output, the operand it is identical to, if any.
pub type ForwardingRule = fn(&Registry, &Equation) -> Vec<Option<usize>>;

/// Constant folding rule over partially known operands.
///
/// Returns concrete results when they can be determined from the known
/// operands alone.
pub type ConstFoldRule = fn(&[Option<&Value>], &Params, &[AbstractValue]) -> Option<Vec<Value>>;

/// Registry of primitive implementations and transformation rules.
pub struct Registry {
    impls: HashMap<Primitive, Arc<dyn PrimitiveImpl>>,
    partial_eval_rules: HashMap<Primitive, PartialEvalRule>,
    dce_rules: HashMap<Primitive, DceRule>,
    forwarding_rules: HashMap<Primitive, ForwardingRule>,
    const_fold_rules: HashMap<Primitive, ConstFoldRule>,
    config: Config,
    cache: TransformCache,
}

impl Registry {
    /// Registry with the builtin primitives and rules.
    pub fn new(config: Config) -> Self {
        let mut registry = Self::empty(config);
        register_builtins(&mut registry);
        partial_eval::register_rules(&mut registry);
        dce::register_rules(&mut registry);
        forwarding::register_rules(&mut registry);
        registry
    }

    /// Registry with no primitives at all.
    pub fn empty(config: Config) -> Self {
        Self {
            impls: HashMap::new(),
            partial_eval_rules: HashMap::new(),
            dce_rules: HashMap::new(),
            forwarding_rules: HashMap::new(),
            const_fold_rules: HashMap::new(),
            config,
            cache: TransformCache::with_capacity(config.cache_capacity),
        }
    }

    /// Active configuration.
    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Memoization tables.
    #[inline]
    pub fn cache(&self) -> &TransformCache {
        &self.cache
    }

    /// Register (or replace) the implementation of a primitive.
    pub fn register(&mut self, prim: Primitive, imp: Arc<dyn PrimitiveImpl>) {
        self.impls.insert(prim, imp);
    }

    /// Register a custom partial evaluation rule.
    pub fn register_partial_eval_rule(&mut self, prim: Primitive, rule: PartialEvalRule) {
        self.partial_eval_rules.insert(prim, rule);
    }

    /// Register a custom DCE rule.
    pub fn register_dce_rule(&mut self, prim: Primitive, rule: DceRule) {
        self.dce_rules.insert(prim, rule);
    }

    /// Register a forwarding rule.
    pub fn register_forwarding_rule(&mut self, prim: Primitive, rule: ForwardingRule) {
        self.forwarding_rules.insert(prim, rule);
    }

    /// Register a constant folding rule.
    pub fn register_const_fold_rule(&mut self, prim: Primitive, rule: ConstFoldRule) {
        self.const_fold_rules.insert(prim, rule);
    }

    /// Implementation of a primitive.
    pub fn lookup(&self, prim: &Primitive) -> Result<&dyn PrimitiveImpl> {
        self.impls
            .get(prim)
            .map(|imp| imp.as_ref())
            .ok_or_else(|| Error::MissingRule { primitive: prim.clone(), kind: "implementation" })
    }

    /// Custom partial evaluation rule, if registered.
    pub fn partial_eval_rule(&self, prim: &Primitive) -> Option<PartialEvalRule> {
        self.partial_eval_rules.get(prim).copied()
    }

    /// Custom DCE rule, if registered.
    pub fn dce_rule(&self, prim: &Primitive) -> Option<DceRule> {
        self.dce_rules.get(prim).copied()
    }

    /// Forwarding rule, if registered.
    pub fn forwarding_rule(&self, prim: &Primitive) -> Option<ForwardingRule> {
        self.forwarding_rules.get(prim).copied()
    }

    /// Constant folding rule, if registered.
    pub fn const_fold_rule(&self, prim: &Primitive) -> Option<ConstFoldRule> {
        self.const_fold_rules.get(prim).copied()
    }

    /// Whether applying `prim` with `params` must always be staged.
    pub fn is_effectful(&self, prim: &Primitive, params: &Params) -> Result<bool> {
        Ok(self.lookup(prim)?.is_effectful(params))
    }

    /// Abstract evaluation with arity checking and memoization.
    ///
    /// Results are cached by primitive, operand types and parameters.
    pub fn abstract_eval(
        &self,
        prim: &Primitive,
        avals: &[AbstractValue],
        params: &Params,
    ) -> Result<(Vec<AbstractValue>, Effects)> {
        let imp = self.lookup(prim)?;
        let cacheable = params.first_unhashable().is_none();
        if cacheable {
            if let Some(hit) = self.cache.lookup_abstract_eval(prim, avals, params) {
                return Ok(hit);
            }
        }
        let (out_avals, effects) = imp.abstract_eval(prim, avals, params)?;
        if !imp.multiple_results() && out_avals.len() != 1 {
            return Err(Error::ArityMismatch { primitive: prim.clone(), expected: 1, actual: out_avals.len() });
        }
        if cacheable {
            self.cache.insert_abstract_eval(prim, avals, params, (out_avals.clone(), effects.clone()));
        }
        Ok((out_avals, effects))
    }

    /// Concrete evaluation with arity checking.
    pub fn eval(&self, prim: &Primitive, args: &[Value], params: &Params) -> Result<Vec<Value>> {
        let imp = self.lookup(prim)?;
        let outs = imp.eval(self, prim, args, params)?;
        if !imp.multiple_results() && outs.len() != 1 {
            return Err(Error::ArityMismatch { primitive: prim.clone(), expected: 1, actual: outs.len() });
        }
        Ok(outs)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("primitives", &self.impls.len())
            .field("config", &self.config)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Operand helpers
// ---------------------------------------------------------------------------

fn type_error(prim: &Primitive, message: impl Into<String>) -> Error {
    Error::TypeMismatch { primitive: prim.clone(), message: message.into() }
}

fn expect_arity<T>(prim: &Primitive, args: &[T], n: usize) -> Result<()> {
    if args.len() != n {
        return Err(type_error(prim, format!("expected {} operand(s), got {}", n, args.len())));
    }
    Ok(())
}

fn expect_array_aval<'a>(prim: &Primitive, aval: &'a AbstractValue) -> Result<&'a AbstractValue> {
    if aval.is_ref() {
        return Err(type_error(prim, format!("expected an array, got {}", aval)));
    }
    Ok(aval)
}

fn array_arg<'a>(prim: &Primitive, value: &'a Value) -> Result<&'a Array> {
    value
        .as_array()
        .ok_or_else(|| Error::Eval { primitive: prim.clone(), message: "expected an array operand".into() })
}

fn ref_arg<'a>(prim: &Primitive, value: &'a Value) -> Result<&'a ArrayRef> {
    value
        .as_array_ref()
        .ok_or_else(|| Error::Eval { primitive: prim.clone(), message: "expected a reference operand".into() })
}

fn single(array: Array) -> Vec<Value> {
    vec![Value::Array(array)]
}

// ---------------------------------------------------------------------------
// Elementwise
// ---------------------------------------------------------------------------

/// Elementwise unary primitive.
pub struct UnaryOp {
    f: fn(f32) -> f32,
    float_only: bool,
}

impl PrimitiveImpl for UnaryOp {
    fn abstract_eval(&self, prim: &Primitive, avals: &[AbstractValue], _: &Params) -> Result<(Vec<AbstractValue>, Effects)> {
        expect_arity(prim, avals, 1)?;
        let x = expect_array_aval(prim, &avals[0])?;
        if self.float_only && !x.dtype().is_float() {
            return Err(type_error(prim, format!("expected a floating-point operand, got {}", x)));
        }
        Ok((vec![x.clone()], Effects::new()))
    }

    fn eval(&self, _: &Registry, prim: &Primitive, args: &[Value], _: &Params) -> Result<Vec<Value>> {
        expect_arity(prim, args, 1)?;
        let x = array_arg(prim, &args[0])?;
        Ok(single(x.map(x.dtype(), self.f)))
    }
}

/// Elementwise binary primitive with NumPy broadcasting.
pub struct BinaryOp {
    f: fn(f32, f32) -> f32,
}

impl PrimitiveImpl for BinaryOp {
    fn abstract_eval(&self, prim: &Primitive, avals: &[AbstractValue], _: &Params) -> Result<(Vec<AbstractValue>, Effects)> {
        expect_arity(prim, avals, 2)?;
        let lhs = expect_array_aval(prim, &avals[0])?;
        let rhs = expect_array_aval(prim, &avals[1])?;
        if lhs.dtype() != rhs.dtype() {
            return Err(type_error(prim, format!("operand dtypes differ: {} and {}", lhs, rhs)));
        }
        let shape = lhs
            .shape()
            .broadcast_with(rhs.shape())
            .ok_or_else(|| type_error(prim, format!("shapes {} and {} do not broadcast", lhs.shape(), rhs.shape())))?;
        Ok((vec![AbstractValue::array(shape, lhs.dtype())], Effects::new()))
    }

    fn eval(&self, _: &Registry, prim: &Primitive, args: &[Value], _: &Params) -> Result<Vec<Value>> {
        expect_arity(prim, args, 2)?;
        let lhs = array_arg(prim, &args[0])?;
        let rhs = array_arg(prim, &args[1])?;
        let out = lhs.zip_with(rhs, lhs.dtype(), self.f).ok_or_else(|| Error::Eval {
            primitive: prim.clone(),
            message: format!("shapes {} and {} do not broadcast", lhs.shape(), rhs.shape()),
        })?;
        Ok(single(out))
    }
}

// ---------------------------------------------------------------------------
// Linear algebra and reductions
// ---------------------------------------------------------------------------

/// Vector and matrix products for operands of rank 1 or 2.
pub struct DotOp;

fn dot_dims(prim: &Primitive, lhs: &[Dim], rhs: &[Dim]) -> Result<Vec<Dim>> {
    let (contract_l, keep_l) = match lhs {
        [k] => (k, Vec::new()),
        [m, k] => (k, vec![m.clone()]),
        _ => return Err(type_error(prim, "operands must have rank 1 or 2")),
    };
    let (contract_r, keep_r) = match rhs {
        [k] => (k, Vec::new()),
        [k, n] => (k, vec![n.clone()]),
        _ => return Err(type_error(prim, "operands must have rank 1 or 2")),
    };
    if contract_l != contract_r {
        return Err(type_error(prim, format!("contracting dimensions {} and {} differ", contract_l, contract_r)));
    }
    Ok(keep_l.into_iter().chain(keep_r).collect())
}

impl PrimitiveImpl for DotOp {
    fn abstract_eval(&self, prim: &Primitive, avals: &[AbstractValue], _: &Params) -> Result<(Vec<AbstractValue>, Effects)> {
        expect_arity(prim, avals, 2)?;
        let lhs = expect_array_aval(prim, &avals[0])?;
        let rhs = expect_array_aval(prim, &avals[1])?;
        if lhs.dtype() != rhs.dtype() {
            return Err(type_error(prim, format!("operand dtypes differ: {} and {}", lhs, rhs)));
        }
        let dims = dot_dims(prim, lhs.shape().dims(), rhs.shape().dims())?;
        Ok((vec![AbstractValue::array(Shape::from_dims(dims), lhs.dtype())], Effects::new()))
    }

    fn eval(&self, _: &Registry, prim: &Primitive, args: &[Value], _: &Params) -> Result<Vec<Value>> {
        expect_arity(prim, args, 2)?;
        let lhs = array_arg(prim, &args[0])?;
        let rhs = array_arg(prim, &args[1])?;
        let static_dims = |a: &Array| a.dims().iter().map(|&n| Dim::Static(n)).collect::<Vec<_>>();
        let out_dims: Vec<usize> = dot_dims(prim, &static_dims(lhs), &static_dims(rhs))?
            .iter()
            .filter_map(Dim::as_static)
            .collect();

        let (m, k) = match lhs.dims() {
            [k] => (1, *k),
            [m, k] => (*m, *k),
            _ => unreachable!("rank checked by dot_dims"),
        };
        let n = match rhs.dims() {
            [_] => 1,
            [_, n] => *n,
            _ => unreachable!("rank checked by dot_dims"),
        };
        let (a, b) = (lhs.data(), rhs.data());
        let mut data = vec![0.0f32; m * n];
        for i in 0..m {
            for j in 0..n {
                data[i * n + j] = (0..k).map(|p| a[i * k + p] * b[p * n + j]).sum();
            }
        }
        Ok(single(Array::from_vec_typed(data, out_dims, lhs.dtype())))
    }
}

/// Sum of all elements.
pub struct ReduceSumOp;

impl PrimitiveImpl for ReduceSumOp {
    fn abstract_eval(&self, prim: &Primitive, avals: &[AbstractValue], _: &Params) -> Result<(Vec<AbstractValue>, Effects)> {
        expect_arity(prim, avals, 1)?;
        let x = expect_array_aval(prim, &avals[0])?;
        Ok((vec![AbstractValue::scalar(x.dtype())], Effects::new()))
    }

    fn eval(&self, _: &Registry, prim: &Primitive, args: &[Value], _: &Params) -> Result<Vec<Value>> {
        expect_arity(prim, args, 1)?;
        let x = array_arg(prim, &args[0])?;
        Ok(single(Array::scalar(x.data().iter().sum(), x.dtype())))
    }
}

// ---------------------------------------------------------------------------
// Structural
// ---------------------------------------------------------------------------

/// Cast to the dtype in the `new_dtype` parameter.
pub struct ConvertElementTypeOp;

fn new_dtype(prim: &Primitive, params: &Params) -> Result<DType> {
    params
        .dtype("new_dtype")
        .ok_or_else(|| Error::MissingParam { primitive: prim.clone(), param: "new_dtype".into() })
}

impl PrimitiveImpl for ConvertElementTypeOp {
    fn abstract_eval(&self, prim: &Primitive, avals: &[AbstractValue], params: &Params) -> Result<(Vec<AbstractValue>, Effects)> {
        expect_arity(prim, avals, 1)?;
        let x = expect_array_aval(prim, &avals[0])?;
        Ok((vec![AbstractValue::array(x.shape().clone(), new_dtype(prim, params)?)], Effects::new()))
    }

    fn eval(&self, _: &Registry, prim: &Primitive, args: &[Value], params: &Params) -> Result<Vec<Value>> {
        expect_arity(prim, args, 1)?;
        let x = array_arg(prim, &args[0])?;
        let dtype = new_dtype(prim, params)?;
        if dtype == x.dtype() {
            return Ok(vec![args[0].clone()]);
        }
        Ok(single(x.astype(dtype)))
    }
}

/// `select(pred, on_true, on_false)`, elementwise on a nonzero predicate.
pub struct SelectOp;

impl PrimitiveImpl for SelectOp {
    fn abstract_eval(&self, prim: &Primitive, avals: &[AbstractValue], _: &Params) -> Result<(Vec<AbstractValue>, Effects)> {
        expect_arity(prim, avals, 3)?;
        let pred = expect_array_aval(prim, &avals[0])?;
        let on_true = expect_array_aval(prim, &avals[1])?;
        let on_false = expect_array_aval(prim, &avals[2])?;
        if on_true != on_false {
            return Err(type_error(prim, format!("branch types differ: {} and {}", on_true, on_false)));
        }
        if !pred.shape().is_scalar() && pred.shape() != on_true.shape() {
            return Err(type_error(prim, format!("predicate shape {} does not match {}", pred.shape(), on_true.shape())));
        }
        Ok((vec![on_true.clone()], Effects::new()))
    }

    fn eval(&self, _: &Registry, prim: &Primitive, args: &[Value], _: &Params) -> Result<Vec<Value>> {
        expect_arity(prim, args, 3)?;
        let pred = array_arg(prim, &args[0])?;
        let on_true = array_arg(prim, &args[1])?;
        let on_false = array_arg(prim, &args[2])?;
        if on_true.dims() != on_false.dims() || on_true.dtype() != on_false.dtype() {
            return Err(type_error(prim, format!("branch types differ: {} and {}", on_true.shape(), on_false.shape())));
        }
        if !pred.is_scalar() && pred.dims() != on_true.dims() {
            return Err(type_error(prim, format!("predicate shape {} does not match {}", pred.shape(), on_true.shape())));
        }
        let data = (0..on_true.size())
            .map(|i| {
                let p = if pred.is_scalar() { pred.data()[0] } else { pred.data()[i] };
                if p != 0.0 {
                    on_true.data()[i]
                } else {
                    on_false.data()[i]
                }
            })
            .collect();
        Ok(single(Array::from_vec_typed(data, on_true.dims().to_vec(), on_true.dtype())))
    }
}

/// Apply the closed graph held in the `call_jaxpr` parameter.
pub struct CallOp;

/// The sub-graph of a call equation.
pub fn call_jaxpr<'a>(prim: &Primitive, params: &'a Params) -> Result<&'a Arc<Graph>> {
    params
        .graph("call_jaxpr")
        .ok_or_else(|| Error::MissingParam { primitive: prim.clone(), param: "call_jaxpr".into() })
}

impl PrimitiveImpl for CallOp {
    fn abstract_eval(&self, prim: &Primitive, avals: &[AbstractValue], params: &Params) -> Result<(Vec<AbstractValue>, Effects)> {
        let graph = call_jaxpr(prim, params)?;
        if avals.len() != graph.num_inputs() {
            return Err(Error::LengthMismatch {
                what: "call operands",
                expected: graph.num_inputs(),
                actual: avals.len(),
            });
        }
        Ok((graph.out_avals(), graph.effects.clone()))
    }

    fn eval(&self, registry: &Registry, prim: &Primitive, args: &[Value], params: &Params) -> Result<Vec<Value>> {
        let graph = call_jaxpr(prim, params)?;
        if !graph.constvars.is_empty() {
            return Err(Error::Unsupported(format!("call of {} with unbound constants", graph.name)));
        }
        eval_jaxpr(registry, graph, &[], args)
    }

    fn multiple_results(&self) -> bool {
        true
    }

    fn is_effectful(&self, params: &Params) -> bool {
        params
            .graph("call_jaxpr")
            .map(|g| has_effects_for_partial_eval(&g.effects))
            .unwrap_or(false)
    }
}

/// Place values in the memory kind named by the `memory_kind` parameter.
///
/// The host has a single memory space, so this is the identity on values.
pub struct DevicePutOp;

impl PrimitiveImpl for DevicePutOp {
    fn abstract_eval(&self, _: &Primitive, avals: &[AbstractValue], _: &Params) -> Result<(Vec<AbstractValue>, Effects)> {
        Ok((avals.to_vec(), Effects::new()))
    }

    fn eval(&self, _: &Registry, _: &Primitive, args: &[Value], params: &Params) -> Result<Vec<Value>> {
        log::trace!("device_put of {} value(s) to {:?}", args.len(), params.str("memory_kind"));
        Ok(args.to_vec())
    }

    fn multiple_results(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Effectful
// ---------------------------------------------------------------------------

/// Log operands at info level; carries an ordered effect.
pub struct DebugPrintOp;

impl PrimitiveImpl for DebugPrintOp {
    fn abstract_eval(&self, _: &Primitive, _: &[AbstractValue], _: &Params) -> Result<(Vec<AbstractValue>, Effects)> {
        Ok((Vec::new(), [Effect::Ordered("debug".into())].into_iter().collect()))
    }

    fn eval(&self, _: &Registry, _: &Primitive, args: &[Value], params: &Params) -> Result<Vec<Value>> {
        let fmt = params.str("fmt").unwrap_or("debug_print");
        log::info!("{}: {:?}", fmt, args);
        Ok(Vec::new())
    }

    fn multiple_results(&self) -> bool {
        true
    }

    fn is_effectful(&self, _: &Params) -> bool {
        true
    }
}

/// Allocate a mutable reference initialized from an array.
pub struct MutableArrayOp;

impl PrimitiveImpl for MutableArrayOp {
    fn abstract_eval(&self, prim: &Primitive, avals: &[AbstractValue], _: &Params) -> Result<(Vec<AbstractValue>, Effects)> {
        expect_arity(prim, avals, 1)?;
        let init = expect_array_aval(prim, &avals[0])?;
        let out = AbstractValue::reference(init.shape().clone(), init.dtype());
        Ok((vec![out], [Effect::Alloc].into_iter().collect()))
    }

    fn eval(&self, _: &Registry, prim: &Primitive, args: &[Value], _: &Params) -> Result<Vec<Value>> {
        expect_arity(prim, args, 1)?;
        Ok(vec![Value::Ref(ArrayRef::new(array_arg(prim, &args[0])?.clone()))])
    }

    fn is_effectful(&self, _: &Params) -> bool {
        true
    }
}

/// Read the current contents of a reference.
pub struct RefGetOp;

impl PrimitiveImpl for RefGetOp {
    fn abstract_eval(&self, prim: &Primitive, avals: &[AbstractValue], _: &Params) -> Result<(Vec<AbstractValue>, Effects)> {
        expect_arity(prim, avals, 1)?;
        if !avals[0].is_ref() {
            return Err(type_error(prim, format!("expected a reference, got {}", avals[0])));
        }
        Ok((vec![avals[0].deref()], [Effect::Read(0)].into_iter().collect()))
    }

    fn eval(&self, _: &Registry, prim: &Primitive, args: &[Value], _: &Params) -> Result<Vec<Value>> {
        expect_arity(prim, args, 1)?;
        Ok(single(ref_arg(prim, &args[0])?.get()))
    }

    fn is_effectful(&self, _: &Params) -> bool {
        true
    }
}

/// Overwrite the contents of a reference.
pub struct RefSetOp;

impl PrimitiveImpl for RefSetOp {
    fn abstract_eval(&self, prim: &Primitive, avals: &[AbstractValue], _: &Params) -> Result<(Vec<AbstractValue>, Effects)> {
        expect_arity(prim, avals, 2)?;
        if !avals[0].is_ref() {
            return Err(type_error(prim, format!("expected a reference, got {}", avals[0])));
        }
        if avals[0].deref() != avals[1] {
            return Err(type_error(prim, format!("cannot store {} into {}", avals[1], avals[0])));
        }
        Ok((Vec::new(), [Effect::Write(0)].into_iter().collect()))
    }

    fn eval(&self, _: &Registry, prim: &Primitive, args: &[Value], _: &Params) -> Result<Vec<Value>> {
        expect_arity(prim, args, 2)?;
        ref_arg(prim, &args[0])?.set(array_arg(prim, &args[1])?.clone());
        Ok(Vec::new())
    }

    fn multiple_results(&self) -> bool {
        true
    }

    fn is_effectful(&self, _: &Params) -> bool {
        true
    }
}

fn register_builtins(registry: &mut Registry) {
    let unary: [(Primitive, fn(f32) -> f32, bool); 6] = [
        (Primitive::Neg, |x| -x, false),
        (Primitive::Sin, f32::sin, true),
        (Primitive::Cos, f32::cos, true),
        (Primitive::Exp, f32::exp, true),
        (Primitive::Log, f32::ln, true),
        (Primitive::Tanh, f32::tanh, true),
    ];
    for (prim, f, float_only) in unary {
        registry.register(prim, Arc::new(UnaryOp { f, float_only }));
    }

    let binary: [(Primitive, fn(f32, f32) -> f32); 6] = [
        (Primitive::Add, |a, b| a + b),
        (Primitive::Sub, |a, b| a - b),
        (Primitive::Mul, |a, b| a * b),
        (Primitive::Div, |a, b| a / b),
        (Primitive::Max, f32::max),
        (Primitive::Min, f32::min),
    ];
    for (prim, f) in binary {
        registry.register(prim, Arc::new(BinaryOp { f }));
    }

    registry.register(Primitive::Dot, Arc::new(DotOp));
    registry.register(Primitive::ReduceSum, Arc::new(ReduceSumOp));
    registry.register(Primitive::ConvertElementType, Arc::new(ConvertElementTypeOp));
    registry.register(Primitive::Select, Arc::new(SelectOp));
    registry.register(Primitive::Call, Arc::new(CallOp));
    registry.register(Primitive::DevicePut, Arc::new(DevicePutOp));
    registry.register(Primitive::DebugPrint, Arc::new(DebugPrintOp));
    registry.register(Primitive::MutableArray, Arc::new(MutableArrayOp));
    registry.register(Primitive::RefGet, Arc::new(RefGetOp));
    registry.register(Primitive::RefSet, Arc::new(RefSetOp));
}

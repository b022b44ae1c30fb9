//! Reference interpreter for graphs.
//!
//! Evaluates a graph eagerly on host values by walking its equations in order.

use crate::trace::{Atom, Graph, Registry, Var};
use crate::{Error, Result, Value};
use std::collections::HashMap;

/// Executes graphs on concrete values.
pub struct Interpreter<'r> {
    registry: &'r Registry,
    /// Environment of bound variables (var -> value)
    env: HashMap<Var, Value>,
}

impl<'r> Interpreter<'r> {
    /// Create a new interpreter over the given registry.
    pub fn new(registry: &'r Registry) -> Self {
        Self { registry, env: HashMap::new() }
    }

    /// Execute a graph with constant and argument values.
    ///
    /// Returns the output values.
    pub fn execute(&mut self, graph: &Graph, consts: &[Value], args: &[Value]) -> Result<Vec<Value>> {
        // Fresh environment for every run
        self.env.clear();

        check_len("graph constants", graph.constvars.len(), consts.len())?;
        check_len("graph arguments", graph.invars.len(), args.len())?;
        for (var, value) in graph.constvars.iter().zip(consts).chain(graph.invars.iter().zip(args)) {
            self.write(var, value.clone());
        }

        for eqn in &graph.eqns {
            let ins = eqn.invars.iter().map(|a| self.read(a)).collect::<Result<Vec<_>>>()?;
            let outs = self.registry.eval(&eqn.primitive, &ins, &eqn.params)?;
            check_len("equation results", eqn.outvars.len(), outs.len())?;
            for (var, value) in eqn.outvars.iter().zip(outs) {
                self.write(var, value);
            }
        }

        graph.outvars.iter().map(|a| self.read(a)).collect()
    }

    fn read(&self, atom: &Atom) -> Result<Value> {
        match atom {
            Atom::Lit(lit) => Ok(Value::Array(lit.value.clone())),
            Atom::Var(var) => self
                .env
                .get(var)
                .cloned()
                .ok_or_else(|| Error::UnboundVar { var: var.to_string() }),
        }
    }

    fn write(&mut self, var: &Var, value: Value) {
        if !var.is_dropped() {
            self.env.insert(var.clone(), value);
        }
    }
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(Error::LengthMismatch { what, expected, actual });
    }
    Ok(())
}

/// Evaluate `graph` on concrete constants and arguments.
pub fn eval_jaxpr(registry: &Registry, graph: &Graph, consts: &[Value], args: &[Value]) -> Result<Vec<Value>> {
    Interpreter::new(registry).execute(graph, consts, args)
}

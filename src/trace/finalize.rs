//! Conversion of a finished trace's recipes into a [`Graph`].

use crate::trace::ir::check_jaxpr;
use crate::trace::tracer::{EqnRecipe, Recipe};
use crate::trace::{AbstractValue, Atom, Equation, Graph, JaxprTrace, Tracer, Var};
use crate::{Dim, Error, Result, Value};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// Assemble the graph computing `out_tracers` from `in_tracers`.
///
/// Returns the graph, the values of its constant binders, and the enclosing
/// tracers that the leading graph inputs (one per free variable) stand for.
pub(crate) fn tracers_to_jaxpr(
    trace: &JaxprTrace,
    in_tracers: &[Tracer],
    out_tracers: &[Tracer],
) -> Result<(Graph, Vec<Value>, Vec<Tracer>)> {
    let handles = trace.effect_handles();
    let mut roots: Vec<Tracer> = in_tracers.iter().chain(out_tracers).cloned().collect();
    for handle in &handles {
        roots.extend(handle.in_tracers.iter().cloned());
    }
    let reachable = toposort(&roots);

    let lambda_ids: HashSet<usize> = in_tracers.iter().map(Tracer::node_id).collect();
    let mut atoms: HashMap<usize, Atom> = HashMap::new();
    let mut subst: HashMap<Var, Atom> = HashMap::new();
    let mut const_vars: HashMap<usize, Var> = HashMap::new();
    let mut consts: Vec<(Var, Value)> = Vec::new();
    let mut env: Vec<(Var, Tracer)> = Vec::new();
    let mut recipes: Vec<Rc<EqnRecipe>> = handles;

    for t in &reachable {
        let node = &t.0;
        let atom = match &node.recipe {
            Recipe::Eqn(recipe) => {
                recipes.push(recipe.clone());
                continue;
            }
            Recipe::Known => {
                return Err(Error::InvalidGraph(format!(
                    "known tracer from {} was used as a staged value",
                    t.provenance()
                )))
            }
            Recipe::LambdaBinding => {
                if !lambda_ids.contains(&t.node_id()) {
                    return Err(Error::EscapedTracer { provenance: t.provenance().to_string() });
                }
                Atom::Var(bind_var(t, &mut subst)?)
            }
            Recipe::FreeVar(referent) => {
                let var = bind_var(t, &mut subst)?;
                env.push((var.clone(), referent.clone()));
                Atom::Var(var)
            }
            Recipe::ConstVar(value) => {
                let own = bind_var(t, &mut subst)?;
                let var = const_vars
                    .entry(value.id())
                    .or_insert_with(|| {
                        consts.push((own.clone(), value.clone()));
                        own.clone()
                    })
                    .clone();
                if var != own {
                    subst.insert(own, Atom::Var(var.clone()));
                }
                Atom::Var(var)
            }
            Recipe::Literal(lit) => {
                let atom = Atom::Lit(lit.clone());
                if let Some(var) = t.var() {
                    subst.insert(var.clone(), atom.clone());
                }
                atom
            }
        };
        atoms.insert(t.node_id(), atom);
    }

    let mut seen: HashSet<usize> = HashSet::new();
    recipes.retain(|r| seen.insert(Rc::as_ptr(r) as usize));
    recipes.sort_by_key(|r| r.eqn_id);

    let mut eqns = Vec::with_capacity(recipes.len());
    for recipe in &recipes {
        let invars = recipe
            .in_tracers
            .iter()
            .map(|t| {
                atoms.get(&t.node_id()).cloned().ok_or_else(|| Error::InvalidGraph(format!(
                    "operand from {} is not bound before {}",
                    t.provenance(),
                    recipe.primitive
                )))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut outvars = Vec::with_capacity(recipe.out_avals.len());
        for (weak, aval) in recipe.out_tracers.borrow().iter().zip(&recipe.out_avals) {
            match weak.upgrade() {
                Some(node) => {
                    let t = Tracer(node);
                    let var = bind_var(&t, &mut subst)?;
                    atoms.insert(t.node_id(), Atom::Var(var.clone()));
                    outvars.push(var);
                }
                None => outvars.push(Var::drop_var(substitute_aval(aval, &subst))),
            }
        }
        eqns.push(Equation::new(
            invars,
            outvars,
            recipe.primitive.clone(),
            recipe.params.clone(),
            recipe.effects.clone(),
            recipe.source.clone(),
        ));
    }

    let lookup = |t: &Tracer| {
        atoms
            .get(&t.node_id())
            .cloned()
            .ok_or_else(|| Error::InvalidGraph(format!("value from {} was never bound", t.provenance())))
    };
    let mut invars: Vec<Var> = env.iter().map(|(v, _)| v.clone()).collect();
    for t in in_tracers {
        match lookup(t)? {
            Atom::Var(v) => invars.push(v),
            Atom::Lit(_) => return Err(Error::InvalidGraph("graph input bound to a literal".into())),
        }
    }
    let outvars = out_tracers.iter().map(lookup).collect::<Result<Vec<_>>>()?;
    let (constvars, const_vals): (Vec<Var>, Vec<Value>) = consts.into_iter().unzip();

    let graph = Graph::new(trace.name(), constvars, invars, outvars, eqns)?;
    let (graph, const_vals) = drop_unused_vars(&graph, const_vals)?;
    if trace.registry().config().enable_checks {
        check_jaxpr(&graph)?;
    }
    log::debug!(
        "finalized `{}`: {} equation(s), {} constant(s), {} free variable(s)",
        graph.name,
        graph.eqns.len(),
        graph.constvars.len(),
        env.len()
    );
    Ok((graph, const_vals, env.into_iter().map(|(_, t)| t).collect()))
}

/// Reachable tracers, each after all of its parents.
fn toposort(roots: &[Tracer]) -> Vec<Tracer> {
    let mut visited: HashSet<usize> = HashSet::new();
    let mut order = Vec::new();
    let mut stack: Vec<(Tracer, bool)> = roots.iter().rev().map(|t| (t.clone(), false)).collect();
    while let Some((t, expanded)) = stack.pop() {
        if expanded {
            order.push(t);
            continue;
        }
        if !visited.insert(t.node_id()) {
            continue;
        }
        let parents = t.parents();
        stack.push((t, true));
        for p in parents.into_iter().rev() {
            if !visited.contains(&p.node_id()) {
                stack.push((p, false));
            }
        }
    }
    order
}

fn substitute_aval(aval: &AbstractValue, subst: &HashMap<Var, Atom>) -> AbstractValue {
    aval.map_dims(|v| match subst.get(v) {
        Some(Atom::Var(w)) => Dim::Dynamic(w.clone()),
        Some(Atom::Lit(lit)) => lit.value.item().map_or(Dim::Dynamic(v.clone()), |n| Dim::Static(n as usize)),
        None => Dim::Dynamic(v.clone()),
    })
}

/// The variable a tracer binds, rebuilt if its dynamic dimensions were renamed.
fn bind_var(t: &Tracer, subst: &mut HashMap<Var, Atom>) -> Result<Var> {
    let var = t
        .var()
        .cloned()
        .ok_or_else(|| Error::InvalidGraph(format!("tracer from {} has no variable", t.provenance())))?;
    if !var.aval().dim_vars().any(|d| subst.contains_key(d)) {
        return Ok(var);
    }
    let renamed = Var::new(substitute_aval(var.aval(), subst));
    subst.insert(var, Atom::Var(renamed.clone()));
    Ok(renamed)
}

/// Drop constants nothing reads and replace unread equation results with
/// drop placeholders.
pub fn drop_unused_vars(graph: &Graph, consts: Vec<Value>) -> Result<(Graph, Vec<Value>)> {
    let mut used: HashSet<Var> = HashSet::new();
    for eqn in &graph.eqns {
        for atom in &eqn.invars {
            used.extend(atom.vars());
        }
    }
    for atom in &graph.outvars {
        used.extend(atom.vars());
    }
    for v in &graph.invars {
        used.extend(v.aval().dim_vars().cloned());
    }

    let (constvars, consts): (Vec<Var>, Vec<Value>) =
        graph.constvars.iter().cloned().zip(consts).filter(|(v, _)| used.contains(v)).unzip();
    let eqns = graph
        .eqns
        .iter()
        .map(|eqn| {
            let outvars = eqn
                .outvars
                .iter()
                .map(|v| {
                    if v.is_dropped() || used.contains(v) {
                        v.clone()
                    } else {
                        Var::drop_var(v.aval().clone())
                    }
                })
                .collect();
            Equation { outvars, ..eqn.clone() }
        })
        .collect();
    let graph = Graph::new(graph.name.clone(), constvars, graph.invars.clone(), graph.outvars.clone(), eqns)?;
    Ok((graph, consts))
}

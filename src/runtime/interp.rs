// Evaluator for projected programs
//
// Projected code is ordinary host forms plus the runtime vocabulary
// (`noop`, `send!`, `recv!`, `make-proj`). Evaluation is against a lexical
// scope chain and a transport; `recur` loops through function application
// without growing the stack.

use std::collections::HashMap;
use std::sync::Arc;

use async_recursion::async_recursion;

use crate::compiler::registry::Context;
use crate::form::{Form, FormKind};
use crate::runtime::transport::Transport;
use crate::runtime::{ChorClosure, HostFn, RoleConfig, RuntimeError, Value};

/// A lexical scope frame.
#[derive(Debug, Default)]
pub struct Scope {
    vars: HashMap<String, Value>,
    parent: Option<Arc<Scope>>,
}

impl Scope {
    pub fn root() -> Arc<Scope> {
        Arc::new(Scope::default())
    }

    pub fn child(parent: &Arc<Scope>, vars: HashMap<String, Value>) -> Arc<Scope> {
        Arc::new(Scope { vars, parent: Some(parent.clone()) })
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        match self.vars.get(name) {
            Some(v) => Some(v.clone()),
            None => self.parent.as_ref().and_then(|p| p.lookup(name)),
        }
    }
}

/// Evaluation outcome: a value, or a `recur` jump in tail position.
enum Ev {
    Val(Value),
    Recur(Vec<Value>),
}

pub(crate) struct Vm<'a, T: Transport> {
    ctx: &'a Context,
    transport: &'a mut T,
    /// Current locator mapping: definition role position to locator index.
    map: Vec<usize>,
}

impl<'a, T: Transport> Vm<'a, T> {
    pub fn new(ctx: &'a Context, transport: &'a mut T, map: Vec<usize>) -> Self {
        Vm { ctx, transport, map }
    }

    pub async fn eval_value(&mut self, scope: &Arc<Scope>, form: &Form) -> Result<Value, RuntimeError> {
        match self.eval(scope, form).await? {
            Ev::Val(v) => Ok(v),
            Ev::Recur(_) => Err(RuntimeError::BadArgument("recur outside of a function".to_string())),
        }
    }

    #[async_recursion]
    async fn eval(&mut self, scope: &Arc<Scope>, form: &Form) -> Result<Ev, RuntimeError> {
        match &form.kind {
            FormKind::Nil => Ok(Ev::Val(Value::Nil)),
            FormKind::Bool(b) => Ok(Ev::Val(Value::Bool(*b))),
            FormKind::Int(n) => Ok(Ev::Val(Value::Int(*n))),
            FormKind::Str(s) => Ok(Ev::Val(Value::Str(s.clone()))),
            FormKind::Keyword(k) => Ok(Ev::Val(Value::Keyword(k.clone()))),
            FormKind::Sym(name) => self.resolve(scope, name).map(Ev::Val),
            FormKind::Vector(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval_value(scope, item).await?);
                }
                Ok(Ev::Val(Value::Vector(out)))
            }
            FormKind::Set(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    let v = self.eval_value(scope, item).await?;
                    if !out.contains(&v) {
                        out.push(v);
                    }
                }
                Ok(Ev::Val(Value::Set(out)))
            }
            FormKind::Map(pairs) => {
                let mut out = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    out.push((self.eval_value(scope, k).await?, self.eval_value(scope, v).await?));
                }
                Ok(Ev::Val(Value::Map(out)))
            }
            FormKind::List(items) => self.eval_list(scope, form, items).await,
        }
    }

    fn resolve(&self, scope: &Arc<Scope>, name: &str) -> Result<Value, RuntimeError> {
        if name == "noop" {
            return Ok(Value::Noop);
        }
        if let Some(v) = scope.lookup(name) {
            return Ok(v);
        }
        if let Some(builtin) = BUILTINS.iter().copied().find(|b| *b == name) {
            return Ok(Value::Builtin(builtin));
        }
        Err(RuntimeError::Undefined(name.to_string()))
    }

    async fn eval_list(
        &mut self,
        scope: &Arc<Scope>,
        form: &Form,
        items: &[Form],
    ) -> Result<Ev, RuntimeError> {
        let Some(head) = items.first() else {
            return Err(RuntimeError::BadArgument("cannot evaluate an empty list".to_string()));
        };
        let args = &items[1..];
        if let Some(op) = head.as_sym() {
            match op {
                "quote" => {
                    let quoted = args.first().ok_or_else(|| {
                        RuntimeError::BadArgument("quote needs a form".to_string())
                    })?;
                    return Ok(Ev::Val(quote_value(quoted)));
                }
                "if" => {
                    let [test, then, rest @ ..] = args else {
                        return Err(RuntimeError::BadArgument("malformed if".to_string()));
                    };
                    let guard = self.eval_value(scope, test).await?;
                    return if guard.truthy() {
                        self.eval(scope, then).await
                    } else if let Some(els) = rest.first() {
                        self.eval(scope, els).await
                    } else {
                        Ok(Ev::Val(Value::Nil))
                    };
                }
                "case" => return self.eval_case(scope, args).await,
                "let" => return self.eval_let(scope, form, args).await,
                "do" => return self.eval_body(scope, args).await,
                "fn" => return Ok(Ev::Val(self.make_fn(scope, args)?)),
                "throw" => {
                    let value = match args.first() {
                        Some(expr) => self.eval_value(scope, expr).await?,
                        None => Value::Nil,
                    };
                    return Err(RuntimeError::Thrown(value));
                }
                "try" => return self.eval_try(scope, args).await,
                "recur" => {
                    let mut out = Vec::with_capacity(args.len());
                    for arg in args {
                        out.push(self.eval_value(scope, arg).await?);
                    }
                    return Ok(Ev::Recur(out));
                }
                "send!" => {
                    let [idx, expr] = args else {
                        return Err(RuntimeError::BadArgument("malformed send!".to_string()));
                    };
                    let locator = self.locator(idx)?;
                    let value = self.eval_value(scope, expr).await?;
                    self.transport.send(locator, value.clone()).await?;
                    return Ok(Ev::Val(value));
                }
                "recv!" => {
                    let [idx] = args else {
                        return Err(RuntimeError::BadArgument("malformed recv!".to_string()));
                    };
                    let locator = self.locator(idx)?;
                    return Ok(Ev::Val(self.transport.recv(locator).await?));
                }
                "make-proj" => return self.make_proj(args).map(Ev::Val),
                _ => {}
            }
        }
        let callee = self.eval_value(scope, head).await?;
        let mut call_args = Vec::with_capacity(args.len());
        for arg in args {
            call_args.push(self.eval_value(scope, arg).await?);
        }
        self.apply(callee, call_args).await.map(Ev::Val)
    }

    fn locator(&self, idx: &Form) -> Result<usize, RuntimeError> {
        let i = idx
            .as_int()
            .ok_or_else(|| RuntimeError::BadArgument("locator index must be an integer".to_string()))?;
        self.map
            .get(i as usize)
            .copied()
            .ok_or_else(|| RuntimeError::Transport(format!("no locator at index {i}")))
    }

    async fn eval_case(&mut self, scope: &Arc<Scope>, args: &[Form]) -> Result<Ev, RuntimeError> {
        let Some((expr, rest)) = args.split_first() else {
            return Err(RuntimeError::BadArgument("malformed case".to_string()));
        };
        let value = self.eval_value(scope, expr).await?;
        let mut i = 0;
        while i < rest.len() {
            if i + 1 == rest.len() {
                return self.eval(scope, &rest[i]).await;
            }
            if Value::from_literal(&rest[i]).as_ref() == Some(&value) {
                return self.eval(scope, &rest[i + 1]).await;
            }
            i += 2;
        }
        Err(RuntimeError::BadArgument(format!("no case clause matches {value}")))
    }

    async fn eval_let(
        &mut self,
        scope: &Arc<Scope>,
        form: &Form,
        args: &[Form],
    ) -> Result<Ev, RuntimeError> {
        let Some((bindings, body)) = args.split_first() else {
            return Err(RuntimeError::BadArgument(format!("malformed let {form}")));
        };
        let Some(pairs) = bindings.as_vector() else {
            return Err(RuntimeError::BadArgument(format!("malformed let bindings in {form}")));
        };
        let mut scope = scope.clone();
        for pair in pairs.chunks(2) {
            let [pattern, init] = pair else {
                return Err(RuntimeError::BadArgument(format!("dangling let binding in {form}")));
            };
            let value = self.eval_value(&scope, init).await?;
            let mut vars = HashMap::new();
            bind_pattern(&mut vars, pattern, value)?;
            scope = Scope::child(&scope, vars);
        }
        self.eval_body(&scope, body).await
    }

    async fn eval_body(&mut self, scope: &Arc<Scope>, body: &[Form]) -> Result<Ev, RuntimeError> {
        let Some((last, init)) = body.split_last() else {
            return Ok(Ev::Val(Value::Nil));
        };
        for stmt in init {
            self.eval_value(scope, stmt).await?;
        }
        self.eval(scope, last).await
    }

    fn make_fn(&self, scope: &Arc<Scope>, args: &[Form]) -> Result<Value, RuntimeError> {
        let (name, rest) = match args.first() {
            Some(f) if f.as_sym().is_some() => (f.as_sym().map(String::from), &args[1..]),
            _ => (None, args),
        };
        let Some((params, body)) = rest.split_first() else {
            return Err(RuntimeError::BadArgument("malformed fn".to_string()));
        };
        let Some(patterns) = params.as_vector() else {
            return Err(RuntimeError::BadArgument("fn parameters must be a vector".to_string()));
        };
        Ok(Value::Fn(HostFn {
            name,
            params: patterns.to_vec(),
            body: Arc::new(body.to_vec()),
            scope: scope.clone(),
            map: self.map.clone(),
        }))
    }

    async fn eval_try(&mut self, scope: &Arc<Scope>, args: &[Form]) -> Result<Ev, RuntimeError> {
        let mut body = Vec::new();
        let mut catches = Vec::new();
        let mut finally = None;
        for item in args {
            match item.op_sym() {
                Some("catch") => catches.push(item.as_list().expect("op_sym implies a list")),
                Some("finally") => finally = Some(item.as_list().expect("op_sym implies a list")),
                _ => body.push(item.clone()),
            }
        }
        let mut result = self.eval_body(scope, &body).await;
        if let Err(RuntimeError::Thrown(value)) = &result {
            if let Some(clause) = catches.first() {
                let Some(sym) = clause.get(1).and_then(Form::as_sym) else {
                    return Err(RuntimeError::BadArgument("malformed catch".to_string()));
                };
                let mut vars = HashMap::new();
                vars.insert(sym.to_string(), value.clone());
                let handler_scope = Scope::child(scope, vars);
                result = self.eval_body(&handler_scope, &clause[2..]).await;
            }
        }
        if let Some(clause) = finally {
            self.eval_body(scope, &clause[1..]).await?;
        }
        result
    }

    /// Instantiate a projection: compose the emitted index mapping with the
    /// current one, and verify the baked signature when asked to.
    fn make_proj(&self, args: &[Form]) -> Result<Value, RuntimeError> {
        let name = args
            .first()
            .and_then(Form::as_list)
            .and_then(|q| q.get(1))
            .and_then(Form::as_sym)
            .ok_or_else(|| RuntimeError::BadArgument("malformed make-proj name".to_string()))?;
        let pos = args
            .get(1)
            .and_then(Form::as_int)
            .ok_or_else(|| RuntimeError::BadArgument("malformed make-proj position".to_string()))?;
        let indices = args
            .get(2)
            .and_then(Form::as_vector)
            .ok_or_else(|| RuntimeError::BadArgument("malformed make-proj mapping".to_string()))?;
        let mut map = Vec::with_capacity(indices.len());
        for idx in indices {
            map.push(self.locator(idx)?);
        }
        if let Some(expected) = args.get(3) {
            let FormKind::Str(expected) = &expected.kind else {
                return Err(RuntimeError::BadArgument("malformed make-proj signature".to_string()));
            };
            let def = self
                .ctx
                .lookup(name)
                .ok_or_else(|| RuntimeError::UnknownChor(name.to_string()))?;
            let found = def.positional_signature().rendered();
            if found != *expected {
                let block = !matches!(args.get(4).map(|f| &f.kind), Some(FormKind::Keyword(k)) if k == "warn");
                if block {
                    return Err(RuntimeError::SignatureChanged {
                        name: name.to_string(),
                        expected: expected.clone(),
                        found,
                    });
                }
                tracing::warn!(
                    name,
                    expected = %expected,
                    found = %found,
                    "signature changed since compile time"
                );
            }
        }
        Ok(Value::Chor(ChorClosure { name: name.to_string(), pos: pos as usize, map }))
    }

    #[async_recursion]
    pub async fn apply(&mut self, callee: Value, args: Vec<Value>) -> Result<Value, RuntimeError> {
        match callee {
            Value::Fn(func) => self.apply_fn(func, args).await,
            Value::Chor(closure) => self.apply_closure(closure, args).await,
            Value::Builtin(name) => call_builtin(name, args),
            other => Err(RuntimeError::NotCallable(other)),
        }
    }

    async fn apply_fn(&mut self, func: HostFn, mut args: Vec<Value>) -> Result<Value, RuntimeError> {
        // The body speaks in the locator space the function was created in.
        let saved = std::mem::replace(&mut self.map, func.map.clone());
        let outcome = loop {
            if args.len() != func.params.len() {
                break Err(RuntimeError::BadArgument(format!(
                    "function takes {} arguments, {} given",
                    func.params.len(),
                    args.len()
                )));
            }
            let mut vars = HashMap::new();
            if let Some(name) = &func.name {
                vars.insert(name.clone(), Value::Fn(func.clone()));
            }
            let mut bind = Ok(());
            for (pattern, value) in func.params.iter().zip(args.drain(..)) {
                bind = bind_pattern(&mut vars, pattern, value);
                if bind.is_err() {
                    break;
                }
            }
            if let Err(e) = bind {
                break Err(e);
            }
            let scope = Scope::child(&func.scope, vars);
            match self.eval_body(&scope, &func.body).await {
                Ok(Ev::Val(v)) => break Ok(v),
                Ok(Ev::Recur(next)) => args = next,
                Err(e) => break Err(e),
            }
        };
        self.map = saved;
        outcome
    }

    async fn apply_closure(
        &mut self,
        closure: ChorClosure,
        args: Vec<Value>,
    ) -> Result<Value, RuntimeError> {
        let def = self
            .ctx
            .lookup(&closure.name)
            .ok_or_else(|| RuntimeError::UnknownChor(closure.name.clone()))?;
        let Some(projections) = def.projections.as_ref() else {
            return Err(RuntimeError::BadArgument(format!(
                "{} is only forward-declared and has no body",
                closure.name
            )));
        };
        let Some(projection) = projections.get(closure.pos) else {
            return Err(RuntimeError::BadArgument(format!(
                "{} has no projection at position {}",
                closure.name, closure.pos
            )));
        };
        if projection.is_sym("noop") {
            return Ok(Value::Noop);
        }
        let projection = projection.clone();
        let saved = std::mem::replace(&mut self.map, closure.map.clone());
        let scope = Scope::root();
        let outcome = match self.eval_value(&scope, &projection).await {
            Ok(callee) => self.apply(callee, args).await,
            Err(e) => Err(e),
        };
        self.map = saved;
        outcome
    }
}

/// Call a choreography value returned to the host; both instantiated
/// choreographies and projected anonymous chors already captured their
/// locator mapping from the configuration they were created under.
pub async fn apply_chor<T: Transport>(
    ctx: &Context,
    config: &mut RoleConfig<T>,
    chor: &Value,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    if !matches!(chor, Value::Chor(_) | Value::Fn(_)) {
        return Err(RuntimeError::NotCallable(chor.clone()));
    }
    let mut vm = Vm::new(ctx, &mut config.transport, Vec::new());
    vm.apply(chor.clone(), args).await
}

fn bind_pattern(
    vars: &mut HashMap<String, Value>,
    pattern: &Form,
    value: Value,
) -> Result<(), RuntimeError> {
    match &pattern.kind {
        FormKind::Sym(name) => {
            vars.insert(name.clone(), value);
            Ok(())
        }
        FormKind::Vector(patterns) => {
            let Value::Vector(values) = value else {
                return Err(RuntimeError::BadArgument(format!(
                    "cannot destructure {value} with {pattern}"
                )));
            };
            if patterns.len() != values.len() {
                return Err(RuntimeError::BadArgument(format!(
                    "pattern {pattern} does not match a vector of {} elements",
                    values.len()
                )));
            }
            for (p, v) in patterns.iter().zip(values) {
                bind_pattern(vars, p, v)?;
            }
            Ok(())
        }
        _ => Err(RuntimeError::BadArgument(format!("bad binding pattern {pattern}"))),
    }
}

fn quote_value(form: &Form) -> Value {
    match &form.kind {
        FormKind::Nil => Value::Nil,
        FormKind::Bool(b) => Value::Bool(*b),
        FormKind::Int(n) => Value::Int(*n),
        FormKind::Str(s) => Value::Str(s.clone()),
        FormKind::Keyword(k) => Value::Keyword(k.clone()),
        FormKind::Sym(s) => Value::Sym(s.clone()),
        FormKind::List(items) | FormKind::Vector(items) => {
            Value::Vector(items.iter().map(quote_value).collect())
        }
        FormKind::Set(items) => Value::Set(items.iter().map(quote_value).collect()),
        FormKind::Map(pairs) => {
            Value::Map(pairs.iter().map(|(k, v)| (quote_value(k), quote_value(v))).collect())
        }
    }
}

pub(crate) const BUILTINS: &[&str] = &[
    "+", "-", "*", "/", "mod", "inc", "dec", "min", "max", "=", "not=", "<", ">", "<=", ">=",
    "even?", "odd?", "zero?", "not", "nil?", "count", "nth", "first", "second", "rest", "get",
    "conj", "assoc", "vector", "hash-map", "hash-set", "str", "println", "modpow", "uniform?",
    "agreement-error",
];

/// True when `name` resolves to a runtime builtin; the compiler lets these
/// shadow choreography names in ordinary call position.
pub(crate) fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

fn int_of(value: &Value) -> Result<i64, RuntimeError> {
    match value {
        Value::Int(n) => Ok(*n),
        other => Err(RuntimeError::BadArgument(format!("expected an integer, found {other}"))),
    }
}

fn fold_ints(
    args: &[Value],
    init: i64,
    f: impl Fn(i64, i64) -> Result<i64, RuntimeError>,
) -> Result<Value, RuntimeError> {
    let mut acc = match args.split_first() {
        Some((first, _)) if args.len() > 1 => int_of(first)?,
        Some((first, _)) => return f(init, int_of(first)?).map(Value::Int),
        None => return Ok(Value::Int(init)),
    };
    for arg in &args[1..] {
        acc = f(acc, int_of(arg)?)?;
    }
    Ok(Value::Int(acc))
}

fn compare_chain(args: &[Value], ok: impl Fn(i64, i64) -> bool) -> Result<Value, RuntimeError> {
    for pair in args.windows(2) {
        if !ok(int_of(&pair[0])?, int_of(&pair[1])?) {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn call_builtin(name: &str, args: Vec<Value>) -> Result<Value, RuntimeError> {
    match name {
        "+" => {
            let mut acc = 0i64;
            for arg in &args {
                acc += int_of(arg)?;
            }
            Ok(Value::Int(acc))
        }
        "*" => {
            let mut acc = 1i64;
            for arg in &args {
                acc *= int_of(arg)?;
            }
            Ok(Value::Int(acc))
        }
        "-" => match args.len() {
            0 => Err(RuntimeError::BadArgument("- needs an argument".to_string())),
            1 => Ok(Value::Int(-int_of(&args[0])?)),
            _ => fold_ints(&args, 0, |a, b| Ok(a - b)),
        },
        "/" => fold_ints(&args, 1, |a, b| {
            if b == 0 {
                Err(RuntimeError::BadArgument("division by zero".to_string()))
            } else {
                Ok(a / b)
            }
        }),
        "mod" => {
            let [a, b] = args.as_slice() else {
                return Err(RuntimeError::BadArgument("mod takes two arguments".to_string()));
            };
            let m = int_of(b)?;
            if m == 0 {
                return Err(RuntimeError::BadArgument("division by zero".to_string()));
            }
            Ok(Value::Int(int_of(a)?.rem_euclid(m)))
        }
        "inc" => Ok(Value::Int(int_of(args.first().unwrap_or(&Value::Nil))? + 1)),
        "dec" => Ok(Value::Int(int_of(args.first().unwrap_or(&Value::Nil))? - 1)),
        "min" => fold_ints(&args, i64::MAX, |a, b| Ok(a.min(b))),
        "max" => fold_ints(&args, i64::MIN, |a, b| Ok(a.max(b))),
        "=" => Ok(Value::Bool(args.windows(2).all(|w| w[0] == w[1]))),
        "not=" => Ok(Value::Bool(!args.windows(2).all(|w| w[0] == w[1]))),
        "<" => compare_chain(&args, |a, b| a < b),
        ">" => compare_chain(&args, |a, b| a > b),
        "<=" => compare_chain(&args, |a, b| a <= b),
        ">=" => compare_chain(&args, |a, b| a >= b),
        "even?" => Ok(Value::Bool(int_of(args.first().unwrap_or(&Value::Nil))? % 2 == 0)),
        "odd?" => Ok(Value::Bool(int_of(args.first().unwrap_or(&Value::Nil))? % 2 != 0)),
        "zero?" => Ok(Value::Bool(int_of(args.first().unwrap_or(&Value::Nil))? == 0)),
        "not" => Ok(Value::Bool(!args.first().map(Value::truthy).unwrap_or(false))),
        "nil?" => Ok(Value::Bool(matches!(args.first(), Some(Value::Nil)))),
        "count" => match args.first() {
            Some(Value::Vector(items)) | Some(Value::Set(items)) => Ok(Value::Int(items.len() as i64)),
            Some(Value::Map(pairs)) => Ok(Value::Int(pairs.len() as i64)),
            Some(Value::Str(s)) => Ok(Value::Int(s.len() as i64)),
            other => Err(RuntimeError::BadArgument(format!("cannot count {other:?}"))),
        },
        "nth" => {
            let [coll, idx] = args.as_slice() else {
                return Err(RuntimeError::BadArgument("nth takes a collection and an index".to_string()));
            };
            let i = int_of(idx)? as usize;
            match coll {
                Value::Vector(items) => items.get(i).cloned().ok_or_else(|| {
                    RuntimeError::BadArgument(format!("index {i} out of bounds"))
                }),
                other => Err(RuntimeError::BadArgument(format!("cannot index {other}"))),
            }
        }
        "first" => match args.first() {
            Some(Value::Vector(items)) => Ok(items.first().cloned().unwrap_or(Value::Nil)),
            other => Err(RuntimeError::BadArgument(format!("cannot take first of {other:?}"))),
        },
        "second" => match args.first() {
            Some(Value::Vector(items)) => Ok(items.get(1).cloned().unwrap_or(Value::Nil)),
            other => Err(RuntimeError::BadArgument(format!("cannot take second of {other:?}"))),
        },
        "rest" => match args.into_iter().next() {
            Some(Value::Vector(items)) => {
                Ok(Value::Vector(items.into_iter().skip(1).collect()))
            }
            other => Err(RuntimeError::BadArgument(format!("cannot take rest of {other:?}"))),
        },
        "get" => {
            let mut iter = args.into_iter();
            let (coll, key) = match (iter.next(), iter.next()) {
                (Some(c), Some(k)) => (c, k),
                _ => return Err(RuntimeError::BadArgument("get takes a collection and a key".to_string())),
            };
            let default = iter.next().unwrap_or(Value::Nil);
            Ok(match coll {
                Value::Map(pairs) => pairs
                    .into_iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| v)
                    .unwrap_or(default),
                Value::Vector(items) => match key {
                    Value::Int(i) if i >= 0 => {
                        items.into_iter().nth(i as usize).unwrap_or(default)
                    }
                    _ => default,
                },
                _ => default,
            })
        }
        "conj" => {
            let mut iter = args.into_iter();
            match iter.next() {
                Some(Value::Vector(mut items)) => {
                    items.extend(iter);
                    Ok(Value::Vector(items))
                }
                Some(Value::Set(mut items)) => {
                    for v in iter {
                        if !items.contains(&v) {
                            items.push(v);
                        }
                    }
                    Ok(Value::Set(items))
                }
                other => Err(RuntimeError::BadArgument(format!("cannot conj onto {other:?}"))),
            }
        }
        "assoc" => {
            let mut iter = args.into_iter();
            let Some(Value::Map(mut pairs)) = iter.next() else {
                return Err(RuntimeError::BadArgument("assoc takes a map".to_string()));
            };
            while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                if let Some(entry) = pairs.iter_mut().find(|(key, _)| *key == k) {
                    entry.1 = v;
                } else {
                    pairs.push((k, v));
                }
            }
            Ok(Value::Map(pairs))
        }
        "vector" => Ok(Value::Vector(args)),
        "hash-map" => {
            let mut pairs = Vec::with_capacity(args.len() / 2);
            let mut iter = args.into_iter();
            while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                pairs.push((k, v));
            }
            Ok(Value::Map(pairs))
        }
        "hash-set" => {
            let mut items = Vec::new();
            for v in args {
                if !items.contains(&v) {
                    items.push(v);
                }
            }
            Ok(Value::Set(items))
        }
        "str" => {
            let mut out = String::new();
            for arg in &args {
                if !matches!(arg, Value::Nil) {
                    out.push_str(&arg.to_string());
                }
            }
            Ok(Value::Str(out))
        }
        "println" => {
            let line =
                args.iter().map(Value::to_string).collect::<Vec<_>>().join(" ");
            println!("{line}");
            Ok(Value::Nil)
        }
        "modpow" => {
            let [base, exp, modulus] = args.as_slice() else {
                return Err(RuntimeError::BadArgument("modpow takes base, exponent, modulus".to_string()));
            };
            let (mut base, mut exp, modulus) =
                (int_of(base)? as i128, int_of(exp)?, int_of(modulus)? as i128);
            if modulus <= 0 {
                return Err(RuntimeError::BadArgument("modpow modulus must be positive".to_string()));
            }
            if exp < 0 {
                return Err(RuntimeError::BadArgument("modpow exponent must be non-negative".to_string()));
            }
            let mut acc: i128 = 1;
            base = base.rem_euclid(modulus);
            while exp > 0 {
                if exp & 1 == 1 {
                    acc = acc * base % modulus;
                }
                base = base * base % modulus;
                exp >>= 1;
            }
            Ok(Value::Int(acc as i64))
        }
        "uniform?" => match args.first() {
            Some(Value::Vector(items)) => {
                Ok(Value::Bool(items.windows(2).all(|w| w[0] == w[1])))
            }
            other => Err(RuntimeError::BadArgument(format!("uniform? takes a vector, found {other:?}"))),
        },
        "agreement-error" => {
            let mut iter = args.into_iter();
            let param = match iter.next() {
                Some(Value::Sym(s)) => s,
                other => format!("{other:?}"),
            };
            let observed = match iter.next() {
                Some(Value::Vector(items)) => items,
                Some(other) => vec![other],
                None => Vec::new(),
            };
            let context = match iter.next() {
                Some(Value::Str(s)) => s,
                _ => String::new(),
            };
            Err(RuntimeError::AgreementMismatch { param, observed, context })
        }
        other => Err(RuntimeError::Undefined(other.to_string())),
    }
}

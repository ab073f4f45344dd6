// Cleanup of projected host forms
//
// Projection is liberal with `do` wrapping and sentinel statements; this
// pass folds nested `do` blocks, drops trivially-pure statements, and
// removes `let` forms left with no bindings. Source spans survive because
// the surviving sub-forms are reused as-is.

use crate::form::{Form, FormKind};

/// Simplify a projected form.
pub fn cleanup(form: Form) -> Form {
    match form.kind {
        FormKind::List(items) => cleanup_list(items, form.span),
        FormKind::Vector(items) => {
            Form::vector(items.into_iter().map(cleanup).collect()).with_span(form.span)
        }
        FormKind::Set(items) => {
            Form::set(items.into_iter().map(cleanup).collect()).with_span(form.span)
        }
        FormKind::Map(pairs) => {
            Form::map(pairs.into_iter().map(|(k, v)| (cleanup(k), cleanup(v))).collect())
                .with_span(form.span)
        }
        other => Form::new(other).with_span(form.span),
    }
}

fn cleanup_list(items: Vec<Form>, span: Option<crate::form::Span>) -> Form {
    match items.first().and_then(Form::as_sym) {
        Some("do") => cleanup_do(items, span),
        Some("let") => cleanup_let(items, span),
        Some("quote") => Form::list(items).with_span(span),
        _ => Form::list(items.into_iter().map(cleanup).collect()).with_span(span),
    }
}

fn cleanup_do(items: Vec<Form>, span: Option<crate::form::Span>) -> Form {
    let mut flat = Vec::new();
    flatten_do(&items[1..], &mut flat);
    let Some(result) = flat.pop() else {
        return Form::sym("noop").with_span(span);
    };
    let mut kept: Vec<Form> = flat.into_iter().filter(|f| !is_pure(f)).collect();
    if kept.is_empty() {
        return result;
    }
    let mut out = vec![Form::sym("do")];
    out.append(&mut kept);
    out.push(result);
    Form::list(out).with_span(span)
}

fn flatten_do(items: &[Form], out: &mut Vec<Form>) {
    for item in items {
        let cleaned = cleanup(item.clone());
        match &cleaned.kind {
            FormKind::List(inner) if inner.first().is_some_and(|h| h.is_sym("do")) => {
                out.extend(inner[1..].iter().cloned());
            }
            _ => out.push(cleaned),
        }
    }
}

fn cleanup_let(items: Vec<Form>, span: Option<crate::form::Span>) -> Form {
    let mut iter = items.into_iter();
    let head = iter.next().expect("list head checked by caller");
    let Some(bindings) = iter.next() else {
        return Form::nil().with_span(span);
    };
    let body: Vec<Form> = iter.map(cleanup).collect();
    let bindings = match bindings.kind {
        FormKind::Vector(pairs) => {
            let mut kept = Vec::with_capacity(pairs.len());
            let mut iter = pairs.into_iter();
            while let (Some(binder), Some(init)) = (iter.next(), iter.next()) {
                let init = cleanup(init);
                // An effect binding of a pure expression does nothing.
                if binder.is_sym("_") && is_pure(&init) {
                    continue;
                }
                kept.push(binder);
                kept.push(init);
            }
            kept
        }
        other => return Form::list(vec![head, Form::new(other)]).with_span(span),
    };
    if bindings.is_empty() {
        let mut out = vec![Form::sym("do")];
        out.extend(body);
        return cleanup(Form::list(out).with_span(span));
    }
    let mut out = vec![head, Form::vector(bindings)];
    out.extend(body);
    Form::list(out).with_span(span)
}

/// Literals, variable references, quotations, and function values have no
/// effects; in statement position they can be dropped.
fn is_pure(form: &Form) -> bool {
    match &form.kind {
        FormKind::Nil
        | FormKind::Bool(_)
        | FormKind::Int(_)
        | FormKind::Str(_)
        | FormKind::Keyword(_)
        | FormKind::Sym(_) => true,
        FormKind::Vector(items) | FormKind::Set(items) => items.iter().all(is_pure),
        FormKind::Map(pairs) => pairs.iter().all(|(k, v)| is_pure(k) && is_pure(v)),
        FormKind::List(items) => {
            matches!(items.first().and_then(Form::as_sym), Some("quote") | Some("fn"))
        }
    }
}

use std::cmp::Ordering;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use regex::Regex;

use crate::eval::parser::Parser;
use crate::eval::stack::StackItem;

/// Boolean coercion used by the logic operators: anything that is not a
/// boolean, undefined included, reads as `false`.
fn truthy(item: &StackItem) -> bool {
    item.boolean_value().unwrap_or(false)
}

/// Numeric coercion for the `numeq` family: this is the only place a string
/// operand is parsed as a number.
fn numeric(item: &StackItem) -> Option<f64> {
    item.number_value()
        .or_else(|| item.string_value().and_then(|s| s.parse::<f64>().ok()))
}

fn parse_version(item: &StackItem) -> Option<Vec<u64>> {
    let text = item.string_value()?;
    text.split('.')
        .map(|part| part.parse::<u64>().ok())
        .collect()
}

/// Componentwise version ordering where a shorter version precedes a longer
/// one with the same prefix (`1.1 < 1.1.0`).
fn compare_versions(a: &[u64], b: &[u64]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match x.cmp(y) {
            Ordering::Equal => {}
            unequal => return unequal,
        }
    }
    a.len().cmp(&b.len())
}

pub(crate) fn register_built_in_operators(parser: &mut Parser) {
    parser.add_operator("isUndefined", |_, stack, _| {
        let item = stack.pop();
        stack.push_boolean(item.is_undefined());
    });

    parser.add_operator("now", |_, stack, _| {
        stack.push_double(Utc::now().timestamp_millis() as f64);
    });

    parser.add_operator("and", |_, stack, _| {
        let left = truthy(&stack.pop());
        let right = truthy(&stack.pop());
        stack.push_boolean(left && right);
    });

    parser.add_operator("or", |_, stack, _| {
        let left = truthy(&stack.pop());
        let right = truthy(&stack.pop());
        stack.push_boolean(left || right);
    });

    parser.add_operator("not", |_, stack, _| {
        let value = truthy(&stack.pop());
        stack.push_boolean(!value);
    });

    parser.add_operator("eq", |_, stack, _| {
        let left = stack.pop();
        let right = stack.pop();
        stack.push_boolean(left.value().deep_eq(right.value()));
    });

    parser.add_operator("ne", |_, stack, _| {
        let left = stack.pop();
        let right = stack.pop();
        stack.push_boolean(!left.value().deep_eq(right.value()));
    });

    parser.add_operator("numeq", |_, stack, _| {
        let left = numeric(&stack.pop());
        let right = numeric(&stack.pop());
        stack.push_boolean(matches!((left, right), (Some(a), Some(b)) if a == b));
    });

    parser.add_operator("numne", |_, stack, _| {
        let left = numeric(&stack.pop());
        let right = numeric(&stack.pop());
        stack.push_boolean(matches!((left, right), (Some(a), Some(b)) if a != b));
    });

    ordering_operator(parser, "lt", |a, b| a < b);
    ordering_operator(parser, "lte", |a, b| a <= b);
    ordering_operator(parser, "gt", |a, b| a > b);
    ordering_operator(parser, "gte", |a, b| a >= b);

    semver_operator(parser, "semverEq", |ord| ord == Ordering::Equal);
    semver_operator(parser, "semverNe", |ord| ord != Ordering::Equal);
    semver_operator(parser, "semverLt", |ord| ord == Ordering::Less);
    semver_operator(parser, "semverLte", |ord| ord != Ordering::Greater);
    semver_operator(parser, "semverGt", |ord| ord == Ordering::Greater);
    semver_operator(parser, "semverGte", |ord| ord != Ordering::Less);

    parser.add_operator("ifThen", |_, stack, _| {
        let condition = stack.pop();
        let when_true = stack.pop();
        let when_false = stack.pop();
        let chosen = if truthy(&condition) { when_true } else { when_false };
        stack.push(chosen.into_value());
    });

    parser.add_operator("inArray", |_, stack, _| {
        let value = stack.pop();
        let list = stack.pop();
        let found = list
            .value()
            .as_list()
            .map(|items| items.iter().any(|item| item.deep_eq(value.value())))
            .unwrap_or(false);
        stack.push_boolean(found);
    });

    parser.add_operator("md5", |_, stack, _| {
        let item = stack.pop();
        match item.string_value() {
            Some(text) => stack.push_string(format!("{:x}", md5::compute(text.as_bytes()))),
            None => stack.push_undefined(),
        }
    });

    parser.add_operator("concat", |_, stack, _| {
        let left = stack.pop();
        let right = stack.pop();
        match (left.string_value(), right.string_value()) {
            (Some(a), Some(b)) => stack.push_string(format!("{a}{b}")),
            _ => stack.push_undefined(),
        }
    });

    parser.add_operator("b64d", |_, stack, _| {
        let item = stack.pop();
        let decoded = item
            .string_value()
            .and_then(|text| BASE64.decode(text.as_bytes()).ok())
            .and_then(|bytes| String::from_utf8(bytes).ok());
        match decoded {
            Some(text) => stack.push_string(text),
            None => stack.push_undefined(),
        }
    });

    parser.add_operator("match", |_, stack, _| {
        let input = stack.pop().string_value();
        let pattern = stack.pop().string_value();
        let flags = stack.pop().string_value().unwrap_or_default();
        let matched = match (input, pattern) {
            (Some(input), Some(pattern)) => regex_matches(&input, &pattern, &flags),
            _ => false,
        };
        stack.push_boolean(matched);
    });
}

fn ordering_operator(parser: &mut Parser, name: &str, compare: fn(f64, f64) -> bool) {
    parser.add_operator(name, move |_, stack, _| {
        let left = stack.pop().number_value();
        let right = stack.pop().number_value();
        stack.push_boolean(matches!((left, right), (Some(a), Some(b)) if compare(a, b)));
    });
}

fn semver_operator(parser: &mut Parser, name: &str, accept: fn(Ordering) -> bool) {
    parser.add_operator(name, move |_, stack, _| {
        let left = parse_version(&stack.pop());
        let right = parse_version(&stack.pop());
        let result = match (left, right) {
            (Some(a), Some(b)) => accept(compare_versions(&a, &b)),
            _ => false,
        };
        stack.push_boolean(result);
    });
}

/// Flags: `i` case-insensitive, `s` dotall, `m` multiline, `x` extended.
fn regex_matches(input: &str, pattern: &str, flags: &str) -> bool {
    let mut inline = String::new();
    for flag in flags.chars() {
        if matches!(flag, 'i' | 's' | 'm' | 'x') && !inline.contains(flag) {
            inline.push(flag);
        }
    }
    let full_pattern = if inline.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{inline}){pattern}")
    };
    match Regex::new(&full_pattern) {
        Ok(regex) => regex.is_match(input),
        Err(error) => {
            tracing::debug!(%pattern, %error, "invalid regular expression in match operator");
            false
        }
    }
}

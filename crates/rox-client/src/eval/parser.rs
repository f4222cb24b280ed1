use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::core::entities::Variant;
use crate::eval::operators;
use crate::eval::stack::CoreStack;
use crate::eval::token::{Node, tokenize};
use crate::model::{Context, DynamicValue};

/// An operator pops its operands from the stack and pushes its result.
pub type Operator = Box<dyn Fn(&Parser, &mut CoreStack, &EvalContext) + Send + Sync>;

/// Per-evaluation state: the flag under evaluation (absent for ad-hoc
/// expressions), the merged context, and whether interception layers are
/// consulted.
#[derive(Clone)]
pub struct EvalContext {
    variant: Option<Arc<Variant>>,
    context: Option<Context>,
    consult_interceptor: bool,
}

impl EvalContext {
    /// Builds the per-call context, merging the variant's global context
    /// (weaker) with the caller-supplied one (stronger).
    pub fn new(variant: Option<&Arc<Variant>>, context: Option<&Context>) -> EvalContext {
        let merged = match variant {
            Some(variant) => {
                let global = variant.global_context();
                match (&global, context) {
                    (None, None) => None,
                    _ => Some(Context::merged(global.as_ref(), context)),
                }
            }
            None => context.cloned(),
        };
        EvalContext {
            variant: variant.cloned(),
            context: merged,
            consult_interceptor: true,
        }
    }

    /// Context for evaluating an expression outside any flag.
    pub fn ad_hoc(context: Option<&Context>) -> EvalContext {
        EvalContext::new(None, context)
    }

    pub fn without_interception(mut self) -> EvalContext {
        self.consult_interceptor = false;
        self
    }

    pub fn variant(&self) -> Option<&Arc<Variant>> {
        self.variant.as_ref()
    }

    pub fn context(&self) -> Option<&Context> {
        self.context.as_ref()
    }

    pub fn consult_interceptor(&self) -> bool {
        self.consult_interceptor
    }
}

/// Outcome of an expression evaluation, remembering the merged context the
/// run used. A fault anywhere leaves the result undefined.
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    value: DynamicValue,
    used_context: Option<Context>,
}

impl EvaluationResult {
    fn new(value: DynamicValue, eval: &EvalContext) -> EvaluationResult {
        EvaluationResult {
            value,
            used_context: eval.context().cloned(),
        }
    }

    pub fn is_undefined(&self) -> bool {
        self.value.is_undefined()
    }

    pub fn value(&self) -> &DynamicValue {
        &self.value
    }

    pub fn boolean_value(&self) -> Option<bool> {
        self.value.as_bool()
    }

    pub fn int_value(&self) -> Option<i64> {
        self.value.as_int()
    }

    pub fn double_value(&self) -> Option<f64> {
        self.value.as_double()
    }

    /// String view; booleans and numbers yield their canonical text.
    pub fn string_value(&self) -> Option<String> {
        self.value.to_canonical_string()
    }

    pub fn used_context(&self) -> Option<&Context> {
        self.used_context.as_ref()
    }
}

/// Stack-based interpreter for the prefix expression language.
///
/// The operator table is populated during construction (built-ins plus the
/// extensions the orchestrator registers); reads thereafter need no locking.
pub struct Parser {
    operators: HashMap<String, Operator>,
}

impl Parser {
    pub fn new() -> Parser {
        let mut parser = Parser {
            operators: HashMap::new(),
        };
        operators::register_built_in_operators(&mut parser);
        parser
    }

    pub fn add_operator(
        &mut self,
        name: &str,
        operation: impl Fn(&Parser, &mut CoreStack, &EvalContext) + Send + Sync + 'static,
    ) {
        self.operators.insert(name.to_string(), Box::new(operation));
    }

    /// Tokenizes and reduces the expression right to left; operands are
    /// pushed, operators consume from the top of the stack. An unknown
    /// operator yields `false`; an empty stack yields undefined.
    pub fn evaluate_expression(&self, expression: &str, eval: &EvalContext) -> EvaluationResult {
        let nodes = tokenize(expression);
        let mut stack = CoreStack::new();
        for node in nodes.iter().rev() {
            match node {
                Node::Operand(value) => stack.push(value.clone()),
                Node::Operator(name) => match self.operators.get(name.as_str()) {
                    Some(operation) => operation(self, &mut stack, eval),
                    None => {
                        debug!(operator = %name, "unknown operator in expression");
                        stack.push_boolean(false);
                    }
                },
            }
        }
        if stack.is_empty() {
            EvaluationResult::new(DynamicValue::Undefined, eval)
        } else {
            EvaluationResult::new(stack.pop().into_value(), eval)
        }
    }
}

impl Default for Parser {
    fn default() -> Parser {
        Parser::new()
    }
}

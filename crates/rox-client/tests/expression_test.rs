use std::sync::Arc;

use rox_client::core::properties::DynamicProperties;
use rox_client::core::repositories::{
    CustomPropertyRepository, ExperimentRepository, FlagRepository, TargetGroupRepository,
};
use rox_client::eval::extensions::{add_experiment_extensions, add_property_extensions};
use rox_client::{CustomProperty, CustomPropertyType, DynamicValue, EvalContext, Parser};

fn create_parser_with_properties() -> (Parser, Arc<CustomPropertyRepository>, Arc<DynamicProperties>)
{
    let flags = Arc::new(FlagRepository::new());
    let experiments = Arc::new(ExperimentRepository::new());
    let target_groups = Arc::new(TargetGroupRepository::new());
    let properties = Arc::new(CustomPropertyRepository::new());
    let dynamics = Arc::new(DynamicProperties::new());
    let mut parser = Parser::new();
    add_property_extensions(&mut parser, &properties, &dynamics);
    add_experiment_extensions(&mut parser, &target_groups, &flags, &experiments);
    (parser, properties, dynamics)
}

fn create_parser() -> Parser {
    create_parser_with_properties().0
}

fn eval_string(parser: &Parser, expression: &str) -> Option<String> {
    parser
        .evaluate_expression(expression, &EvalContext::ad_hoc(None))
        .string_value()
}

fn eval_bool(parser: &Parser, expression: &str) -> Option<bool> {
    parser
        .evaluate_expression(expression, &EvalContext::ad_hoc(None))
        .boolean_value()
}

fn eval_int(parser: &Parser, expression: &str) -> Option<i64> {
    parser
        .evaluate_expression(expression, &EvalContext::ad_hoc(None))
        .int_value()
}

fn eval_double(parser: &Parser, expression: &str) -> Option<f64> {
    parser
        .evaluate_expression(expression, &EvalContext::ad_hoc(None))
        .double_value()
}

#[test]
fn test_simple_expression_evaluation() {
    let parser = create_parser();
    assert_eq!(eval_string(&parser, "true").as_deref(), Some("true"));
    assert_eq!(eval_bool(&parser, "true"), Some(true));
    assert_eq!(eval_string(&parser, "\"red\"").as_deref(), Some("red"));
    assert_eq!(eval_bool(&parser, "and(true, or(true, true))"), Some(true));
    assert_eq!(eval_bool(&parser, "and(true, or(false, true))"), Some(true));
    assert_eq!(
        eval_bool(&parser, "not(and(false, or(false, true)))"),
        Some(true)
    );
}

#[test]
fn test_numeq_expressions_evaluation() {
    let parser = create_parser();
    assert_eq!(eval_bool(&parser, "numeq(\"la la\", \"la la\")"), Some(false));
    assert_eq!(eval_bool(&parser, "numeq(\"la la\", \"la,la\")"), Some(false));
    assert_eq!(eval_bool(&parser, "numeq(\"lala\", \"lala\")"), Some(false));

    assert_eq!(eval_bool(&parser, "numeq(\"10\", \"10\")"), Some(true));
    assert_eq!(eval_bool(&parser, "numeq(\"10\", 10)"), Some(true));
    assert_eq!(eval_bool(&parser, "numeq(10, \"10\")"), Some(true));
    assert_eq!(eval_bool(&parser, "numeq(10, 10)"), Some(true));

    assert_eq!(eval_bool(&parser, "numeq(\"10\", \"11\")"), Some(false));
    assert_eq!(eval_bool(&parser, "numeq(\"10\", 11)"), Some(false));
    assert_eq!(eval_bool(&parser, "numeq(10, \"11\")"), Some(false));
    assert_eq!(eval_bool(&parser, "numeq(10, 11)"), Some(false));

    assert_eq!(eval_bool(&parser, "numne(\"la la\", \"la la\")"), Some(false));
    assert_eq!(eval_bool(&parser, "numne(\"10\", \"10\")"), Some(false));
    assert_eq!(eval_bool(&parser, "numne(10, \"10\")"), Some(false));
    assert_eq!(eval_bool(&parser, "numne(\"10\", 11)"), Some(true));
    assert_eq!(eval_bool(&parser, "numne(10, \"11\")"), Some(true));
    assert_eq!(eval_bool(&parser, "numne(10, 11)"), Some(true));
}

#[test]
fn test_eq_expressions_evaluation() {
    let parser = create_parser();
    assert_eq!(eval_bool(&parser, "eq(\"la la\", \"la la\")"), Some(true));
    assert_eq!(eval_bool(&parser, "eq(\"la la\", \"la,la\")"), Some(false));
    assert_eq!(eval_bool(&parser, "eq(\"lala\", \"lala\")"), Some(true));
    assert_eq!(eval_bool(&parser, "ne(100.123, 100.321)"), Some(true));
    assert_eq!(eval_bool(&parser, "not(eq(undefined, undefined))"), Some(false));
    assert_eq!(
        eval_bool(&parser, "not(eq(not(undefined), undefined))"),
        Some(true)
    );
    assert_eq!(eval_bool(&parser, "not(undefined)"), Some(true));
    assert_eq!(
        eval_bool(&parser, r#"eq("la \"la\" la", "la \"la\" la")"#),
        Some(true)
    );
}

#[test]
fn test_comparison_expressions_evaluation() {
    let parser = create_parser();
    assert_eq!(eval_bool(&parser, "lt(500, 100)"), Some(false));
    assert_eq!(eval_bool(&parser, "lt(500, 500)"), Some(false));
    assert_eq!(eval_bool(&parser, "lt(500, 500.54)"), Some(true));
    assert_eq!(eval_bool(&parser, "lte(500, 500)"), Some(true));
    assert_eq!(eval_bool(&parser, "gt(500, 100)"), Some(true));
    assert_eq!(eval_bool(&parser, "gt(500, 500)"), Some(false));
    assert_eq!(eval_bool(&parser, "gt(500.54, 500)"), Some(true));
    assert_eq!(eval_bool(&parser, "gte(500, 500)"), Some(true));
    assert_eq!(eval_bool(&parser, "gte(\"500\", 500)"), Some(false));
}

#[test]
fn test_semver_comparison_evaluation() {
    let parser = create_parser();
    assert_eq!(eval_bool(&parser, "semverLt(\"1.1.0\", \"1.1\")"), Some(false));
    assert_eq!(eval_bool(&parser, "semverLte(\"1.1.0\", \"1.1\")"), Some(false));
    assert_eq!(eval_bool(&parser, "semverGte(\"1.1.0\", \"1.1\")"), Some(true));
    assert_eq!(eval_bool(&parser, "semverEq(\"1.0.0\", \"1\")"), Some(false));
    assert_eq!(eval_bool(&parser, "semverLt(\"1.1\", \"1.2\")"), Some(true));
    assert_eq!(eval_bool(&parser, "semverLte(\"1.1\", \"1.2\")"), Some(true));
    assert_eq!(eval_bool(&parser, "semverGt(\"1.1.1\", \"1.2\")"), Some(false));
    assert_eq!(eval_bool(&parser, "semverGt(\"1.2.1\", \"1.2\")"), Some(true));
}

#[test]
fn test_comparison_with_undefined_evaluation() {
    let parser = create_parser();
    assert_eq!(eval_bool(&parser, "gte(500, undefined)"), Some(false));
    assert_eq!(eval_bool(&parser, "gt(500, undefined)"), Some(false));
    assert_eq!(eval_bool(&parser, "lte(500, undefined)"), Some(false));
    assert_eq!(eval_bool(&parser, "lt(500, undefined)"), Some(false));
    assert_eq!(eval_bool(&parser, "semverGte(\"1.1\", undefined)"), Some(false));
    assert_eq!(eval_bool(&parser, "semverGt(\"1.1\", undefined)"), Some(false));
    assert_eq!(eval_bool(&parser, "semverLte(\"1.1\", undefined)"), Some(false));
    assert_eq!(eval_bool(&parser, "semverLt(\"1.1\", undefined)"), Some(false));
}

#[test]
fn test_unknown_operator_evaluation() {
    let parser = create_parser();
    assert_eq!(eval_bool(&parser, "NOT_AN_OPERATOR(500, 500)"), Some(false));
    assert_eq!(eval_bool(&parser, "JUSTAWORD(500, 500)"), Some(false));
}

#[test]
fn test_undefined_evaluation() {
    let parser = create_parser();
    assert_eq!(eval_bool(&parser, "isUndefined(undefined)"), Some(true));
    assert_eq!(eval_bool(&parser, "isUndefined(123123)"), Some(false));
    assert_eq!(eval_bool(&parser, "isUndefined(\"undefined\")"), Some(false));
}

#[test]
fn test_now_evaluation() {
    let parser = create_parser();
    assert_eq!(eval_bool(&parser, "gte(now(), now())"), Some(true));
    assert_eq!(eval_bool(&parser, "gte(now(), 2458.123)"), Some(true));
    assert_eq!(eval_bool(&parser, "gte(now(), 1534759307565)"), Some(true));
}

#[test]
fn test_regular_expression_evaluation() {
    let parser = create_parser();
    assert_eq!(eval_bool(&parser, "match(\"111\", \"222\", \"\")"), Some(false));
    assert_eq!(eval_bool(&parser, "match(\".*\", \"222\", \"\")"), Some(false));
    assert_eq!(eval_bool(&parser, "match(\"22222\", \".*\", \"\")"), Some(true));
    assert_eq!(eval_bool(&parser, "match(\"22222\", \"^2*$\", \"\")"), Some(true));
    assert_eq!(
        eval_bool(&parser, "match(\"test@shimi.com\", \".*(com|ca)\", \"\")"),
        Some(true)
    );
    assert_eq!(
        eval_bool(&parser, r#"match("test@jet.com", ".*jet\.com$", "")"#),
        Some(true)
    );
    assert_eq!(eval_bool(&parser, "match(\"US\", \".*IL|US\", \"\")"), Some(true));
    assert_eq!(eval_bool(&parser, "match(\"US\", \"(IL|US)\", \"\")"), Some(true));
    assert_eq!(eval_bool(&parser, "match(\"Us\", \"(IL|US)\", \"\")"), Some(false));
    assert_eq!(eval_bool(&parser, "match(\"uS\", \"(IL|US)\", \"i\")"), Some(true));
    assert_eq!(
        eval_bool(&parser, "match(\"uS\", \"IL|US#Comment\", \"xi\")"),
        Some(true)
    );
    assert_eq!(eval_bool(&parser, "match(\"\n\", \".\", \"s\")"), Some(true));
    assert_eq!(
        eval_bool(
            &parser,
            "match(\"HELLO\nTeST\n#This is a comment\", \"^TEST$\", \"ixm\")"
        ),
        Some(true)
    );
}

#[test]
fn test_if_then_expression_evaluation_string() {
    let parser = create_parser();
    assert_eq!(
        eval_string(&parser, "ifThen(and(true, or(true, true)), \"AB\", \"CD\")").as_deref(),
        Some("AB")
    );
    assert_eq!(
        eval_string(&parser, "ifThen(and(false, or(true, true)), \"AB\", \"CD\")").as_deref(),
        Some("CD")
    );
    assert_eq!(
        eval_string(
            &parser,
            "ifThen(and(true, or(true, true)), \"AB\", ifThen(and(true, or(true, true)), \"EF\", \"CD\"))"
        )
        .as_deref(),
        Some("AB")
    );
    assert_eq!(
        eval_string(
            &parser,
            "ifThen(and(false, or(true, true)), \"AB\", ifThen(and(true, or(true, true)), \"EF\", \"CD\"))"
        )
        .as_deref(),
        Some("EF")
    );
    assert_eq!(
        eval_string(
            &parser,
            "ifThen(and(false, or(true, true)), \"AB\", ifThen(and(true, or(false, false)), \"EF\", \"CD\"))"
        )
        .as_deref(),
        Some("CD")
    );
    assert_eq!(
        eval_string(
            &parser,
            "ifThen(and(false, or(true, true)), \"AB\", ifThen(and(true, or(false, false)), \"EF\", undefined))"
        ),
        None
    );
}

#[test]
fn test_if_then_expression_evaluation_int_number() {
    let parser = create_parser();
    assert_eq!(eval_int(&parser, "ifThen(and(true, or(true, true)), 1, 2)"), Some(1));
    assert_eq!(eval_int(&parser, "ifThen(and(false, or(true, true)), 1, 2)"), Some(2));
    assert_eq!(
        eval_int(
            &parser,
            "ifThen(and(false, or(true, true)), 1, ifThen(and(true, or(true, true)), 3, 2))"
        ),
        Some(3)
    );
    assert_eq!(
        eval_int(
            &parser,
            "ifThen(and(false, or(true, true)), 1, ifThen(and(true, or(false, false)), 3, undefined))"
        ),
        None
    );
}

#[test]
fn test_if_then_expression_evaluation_double_number() {
    let parser = create_parser();
    assert_eq!(
        eval_double(&parser, "ifThen(and(true, or(true, true)), 1.1, 2.2)"),
        Some(1.1)
    );
    assert_eq!(
        eval_double(&parser, "ifThen(and(false, or(true, true)), 1.1, 2.2)"),
        Some(2.2)
    );
    assert_eq!(
        eval_double(
            &parser,
            "ifThen(and(false, or(true, true)), 1.1, ifThen(and(true, or(true, true)), 3.3, 2.2))"
        ),
        Some(3.3)
    );
    assert_eq!(
        eval_double(
            &parser,
            "ifThen(and(false, or(true, true)), 1.1, ifThen(and(true, or(false, false)), 3.3, undefined))"
        ),
        None
    );
}

#[test]
fn test_if_then_expression_evaluation_boolean() {
    let parser = create_parser();
    assert_eq!(
        eval_bool(&parser, "ifThen(and(true, or(true, true)), true, false)"),
        Some(true)
    );
    assert_eq!(
        eval_bool(&parser, "ifThen(and(false, or(true, true)), true, false)"),
        Some(false)
    );
    assert_eq!(
        eval_bool(
            &parser,
            "ifThen(and(false, or(true, true)), false, ifThen(and(true, or(true, true)), true, false))"
        ),
        Some(true)
    );
    assert_eq!(
        eval_bool(
            &parser,
            "ifThen(and(false, or(true, true)), false, ifThen(and(true, or(false, false)), false, (and(true,true))))"
        ),
        Some(true)
    );
    assert_eq!(
        eval_bool(
            &parser,
            "ifThen(and(false, or(true, true)), true, ifThen(and(true, or(false, false)), true, (and(true,false))))"
        ),
        Some(false)
    );
    assert_eq!(
        eval_bool(
            &parser,
            "ifThen(and(false, or(true, true)), true, ifThen(and(true, or(false, false)), true, undefined))"
        ),
        None
    );
}

#[test]
fn test_in_array() {
    let parser = create_parser();
    assert_eq!(
        eval_bool(&parser, "inArray(\"123\", [\"222\", \"233\"])"),
        Some(false)
    );
    assert_eq!(
        eval_bool(&parser, "inArray(\"123\", [\"123\", \"233\"])"),
        Some(true)
    );
    assert_eq!(eval_bool(&parser, "inArray(\"123\", [123, \"233\"])"), Some(false));
    assert_eq!(
        eval_bool(&parser, "inArray(\"123\", [123, \"123\", \"233\"])"),
        Some(true)
    );
    assert_eq!(eval_bool(&parser, "inArray(123, [123, \"233\"])"), Some(true));
    assert_eq!(eval_bool(&parser, "inArray(123, [\"123\", \"233\"])"), Some(false));
    assert_eq!(eval_bool(&parser, "inArray(\"123\", [])"), Some(false));
    assert_eq!(
        eval_bool(&parser, "inArray(\"1 [23\", [\"1 [23\", \"]\"])"),
        Some(true)
    );
    assert_eq!(eval_bool(&parser, "inArray(\"123\", undefined)"), Some(false));
    assert_eq!(eval_bool(&parser, "inArray(undefined, [])"), Some(false));
    assert_eq!(
        eval_bool(&parser, "inArray(undefined, [undefined, 123])"),
        Some(true)
    );
    assert_eq!(eval_bool(&parser, "inArray(undefined, undefined)"), Some(false));
    assert_eq!(
        eval_bool(
            &parser,
            "inArray(mergeSeed(\"123\", \"456\"), [\"123.456\", \"233\"])"
        ),
        Some(true)
    );
}

#[test]
fn test_string_operators() {
    let parser = create_parser();
    assert_eq!(
        eval_string(&parser, "md5(\"stam\")").as_deref(),
        Some("07915255d64730d06d2349d11ac3bfd8")
    );
    assert_eq!(
        eval_string(&parser, "concat(\"stam\",\"stam2\")").as_deref(),
        Some("stamstam2")
    );
    assert_eq!(
        eval_bool(
            &parser,
            "inArray(md5(concat(\"st\",\"am\")), [\"07915255d64730d06d2349d11ac3bfd8\"])"
        ),
        Some(true)
    );
    assert_eq!(
        eval_bool(&parser, "eq(md5(concat(\"st\",property(\"notProp\"))), undefined)"),
        Some(true)
    );
    assert_eq!(eval_string(&parser, "b64d(\"c3RhbQ==\")").as_deref(), Some("stam"));
    assert_eq!(eval_string(&parser, "b64d(\"8Km4vQ==\")").as_deref(), Some("𩸽"));
}

#[test]
fn test_md5_known_digests() {
    let parser = create_parser();
    assert_eq!(
        eval_string(&parser, "md5(\"\")").as_deref(),
        Some("d41d8cd98f00b204e9800998ecf8427e")
    );
    assert_eq!(
        eval_string(&parser, "md5(\"abc\")").as_deref(),
        Some("900150983cd24fb0d6963f7d28e17f72")
    );
}

#[test]
fn test_percentage_buckets() {
    let parser = create_parser();
    assert_eq!(
        eval_bool(&parser, "isInPercentageRange(0, 0.5, \"device2.seed2\")"),
        Some(true)
    );
    assert_eq!(
        eval_bool(&parser, "isInPercentageRange(0.5, 1, \"device2.seed2\")"),
        Some(false)
    );
    assert_eq!(
        eval_bool(&parser, "isInPercentage(0.5, \"device2.seed2\")"),
        Some(true)
    );
    assert_eq!(
        eval_bool(&parser, "isInPercentage(0.1, \"device2.seed2\")"),
        Some(false)
    );
    assert_eq!(
        eval_bool(
            &parser,
            "isInPercentage(0.5, mergeSeed(\"device2\", \"seed2\"))"
        ),
        Some(true)
    );
}

#[test]
fn test_property_with_null_value_is_undefined() {
    let (parser, properties, _dynamics) = create_parser_with_properties();
    properties.add_custom_property(CustomProperty::new(
        "nullProp",
        CustomPropertyType::String,
        DynamicValue::Null,
    ));
    properties.add_custom_property(CustomProperty::with_generator(
        "nullGen",
        CustomPropertyType::String,
        |_| DynamicValue::Null,
    ));

    assert_eq!(
        eval_bool(&parser, "isUndefined(property(\"nullProp\"))"),
        Some(true)
    );
    assert_eq!(
        eval_bool(&parser, "eq(property(\"nullProp\"), undefined)"),
        Some(true)
    );
    assert_eq!(
        eval_bool(&parser, "isUndefined(property(\"nullGen\"))"),
        Some(true)
    );
    assert_eq!(
        eval_string(
            &parser,
            "ifThen(isUndefined(property(\"nullProp\")), \"fallback\", \"set\")"
        )
        .as_deref(),
        Some("fallback")
    );
}

#[test]
fn test_property_preserves_int_dynamic_property() {
    let (parser, _properties, dynamics) = create_parser_with_properties();
    dynamics.set_rule(Arc::new(|name, _| {
        (name == "intProp").then(|| DynamicValue::Int(5))
    }));

    assert_eq!(eval_int(&parser, "property(\"intProp\")"), Some(5));
    assert_eq!(eval_bool(&parser, "eq(property(\"intProp\"), 5)"), Some(true));
    assert_eq!(eval_bool(&parser, "lt(property(\"intProp\"), 10)"), Some(true));
}

#[test]
fn test_int_flag_reads_int_dynamic_property_value() {
    use rox_client::core::entities::{FlagSetter, Variant};
    use rox_client::core::impression::ImpressionInvoker;
    use rox_client::ExperimentModel;

    let flags = Arc::new(FlagRepository::new());
    let experiments = Arc::new(ExperimentRepository::new());
    let target_groups = Arc::new(TargetGroupRepository::new());
    let properties = Arc::new(CustomPropertyRepository::new());
    let dynamics = Arc::new(DynamicProperties::new());
    dynamics.set_rule(Arc::new(|name, _| {
        (name == "intProp").then(|| DynamicValue::Int(7))
    }));
    let mut parser = Parser::new();
    add_property_extensions(&mut parser, &properties, &dynamics);
    add_experiment_extensions(&mut parser, &target_groups, &flags, &experiments);
    let parser = Arc::new(parser);

    let invoker = Arc::new(ImpressionInvoker::new());
    let setter = FlagSetter::new(&flags, &parser, &experiments, &invoker);
    let flag = flags.add_flag(Variant::int(1, &[1, 7]), "int-flag").unwrap();
    experiments.set_experiments(vec![ExperimentModel::new(
        "1",
        "int exp",
        "property(\"intProp\")",
        false,
        vec!["int-flag".into()],
        Default::default(),
        None,
    )]);
    setter.set_experiments();

    let eval = EvalContext::new(Some(&flag), None);
    assert_eq!(flag.get_int(None, &eval), 7);
}

#[test]
fn test_evaluation_is_pure() {
    let parser = create_parser();
    for expression in [
        "and(true, or(false, true))",
        "ifThen(gte(1.5, 1), \"yes\", \"no\")",
        "inArray(\"x\", [\"x\", \"y\"])",
        "md5(\"repeatable\")",
    ] {
        let first = parser.evaluate_expression(expression, &EvalContext::ad_hoc(None));
        let second = parser.evaluate_expression(expression, &EvalContext::ad_hoc(None));
        assert_eq!(first.value(), second.value(), "{expression}");
    }
}

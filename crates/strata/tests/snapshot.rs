//! Snapshot tests
//!
//! Renders vars documents and templates end to end and compares the output and the
//! diagnostic blocks of failures.

use pretty_assertions::assert_eq;
use strata::position::Location;
use strata::{Context, Document, ObjectTemplate, Template, Value};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("STRATA_LOG"))
        .with_writer(std::io::stderr)
        .try_init();
}

/// First diagnostic of `error`, quoting `source` instead of reading the file
fn report(error: strata::Error, source: &str) -> String {
    error.details().remove(0).render_with_source(Some(source), false)
}

fn load(context: &Context, source: &str) -> strata::Result<()> {
    let document = Document::parse(source, Some("vars.yml".into()))?;
    context.load_document(&document)
}

#[test]
fn layered_vars() {
    init_logging();

    let root = Context::from_iter([("env", "prod")]);
    let base = root.chain();
    load(&base, "app: shop\nreplicas: 2\nname: ${app}-${env}\n").unwrap();

    let overrides = base.chain();
    load(&overrides, "scaled: ${replicas * 3}\nlabel: '{{ name|uppercase }}'\n").unwrap();

    let vars = serde_yaml::to_string(&Value::Object(overrides.as_map(true).unwrap())).unwrap();
    insta::assert_snapshot!(vars, @r###"
    app: shop
    replicas: 2
    name: shop-prod
    scaled: 6
    label: SHOP-PROD
    "###);
}

#[test]
fn template_with_includes() {
    init_logging();

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("service.txt"),
        "name: {{ name }}\nports:\n{% for port in ports %}- {{ port }}\n{% endfor %}",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("main.txt"),
        "services:\n  {% include \"service.txt\" name=\"web\" %}\n",
    )
    .unwrap();

    let context = Context::from_iter([("ports", Value::from(vec![80i64, 443]))]);
    let rendered = Template::from_file(dir.path().join("main.txt"))
        .unwrap()
        .render_text(&context)
        .unwrap();

    insta::assert_snapshot!(rendered.trim_end(), @r###"
    services:
      name: web
      ports:
      - 80
      - 443
    "###);
}

#[test]
fn include_arguments_with_and_without_commas() {
    init_logging();

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("entry.txt"), "- {{ name }}:{{ port }}").unwrap();
    std::fs::write(
        dir.path().join("main.txt"),
        concat!(
            "{% include \"entry.txt\" name=\"web\" port=80 %}\n",
            "{% include \"entry.txt\", name=\"db\", port=5432 %}\n",
            "{% include \"entry.txt\" name=\"cache\", port=base + 1 %}\n",
        ),
    )
    .unwrap();

    let context = Context::from_iter([("base", Value::Integer(6378))]);
    let rendered = Template::from_file(dir.path().join("main.txt"))
        .unwrap()
        .render_text(&context)
        .unwrap();

    insta::assert_snapshot!(rendered.trim_end(), @r###"
    - web:80
    - db:5432
    - cache:6379
    "###);
}

#[test]
fn undefined_variable_report() {
    let source = "name: app\nurl: https://${missing}.example.com\n";
    let error = load(&Context::new().chain(), source).unwrap_err();

    insta::assert_snapshot!(report(error, source), @r###"
    ╷
    │ Error: missing is undefined
    │
    │   in vars.yml on line 2 column 16
    │   1:  name: app
    │   2:  url: https://${missing}.example.com
    │                      ^^^^^^^
    ╵
    "###);
}

#[test]
fn circular_dependency_report() {
    let source = "a: ${b}\nb: ${a}\n";
    let error = load(&Context::new().chain(), source).unwrap_err();

    insta::assert_snapshot!(report(error, source), @r###"
    ╷
    │ Error: Found circular dependency: a -> b -> a
    │
    │   in vars.yml on line 1 column 4
    │   1:  a: ${b}
    │          ^^^^
    │   2:  b: ${a}
    ╵
    "###);
}

#[test]
fn protected_variable_report() {
    let source = "env: prod\n";
    let root = Context::from_iter([("env", "dev")]);
    let error = load(&root.chain(), source).unwrap_err();

    insta::assert_snapshot!(report(error, source), @r###"
    ╷
    │ Error: env is protected variable and cannot be altered.
    │
    │   in vars.yml on line 1 column 6
    │   1:  env: prod
    │            ^^^^
    │
    │ Protected variables come from the command line or the environment.
    ╵
    "###);
}

#[test]
fn runtime_error_report() {
    let source = "a\n{{ 1 // 0 }}\n";
    let template = Template::with_location(source, Some(Location::file("main.txt"))).unwrap();
    let error = template.render(&Context::new()).unwrap_err();

    insta::assert_snapshot!(report(error, source), @r###"
    ╷
    │ Error: (ZeroDivisionError) integer division or modulo by zero
    │
    │   in main.txt on line 2
    │   1:  a
    │   2:  {{ 1 // 0 }}
    │       ^^^^^^^^^^^^
    ╵
    "###);
}

#[test]
fn compile_error_in_document() {
    let source = "name: app\nlabel: '{{ name|shout }}'\n";
    let error = load(&Context::new().chain(), source).unwrap_err();
    let detail = error.details().remove(0);

    assert_eq!(detail.message, "Unknown filter: shout");
    assert_eq!(detail.file_path, Some("vars.yml".into()));
    assert_eq!(detail.start.map(|p| (p.line, p.column)), Some((2, Some(17))));
}

#[test]
fn registered_filters_are_available() {
    strata::register_filter("reverse_words", |value, _args| {
        let text = value.to_text();
        Ok(Value::from(text.split(' ').rev().collect::<Vec<_>>().join(" ")))
    })
    .unwrap();
    assert!(strata::register_filter("reverse_words", |value, _| Ok(value.clone())).is_err());

    let template = Template::new("{{ 'a b c'|reverse_words|uppercase }}").unwrap();
    assert_eq!(template.render(&Context::new()).unwrap(), Value::from("C B A"));
}

#[test]
fn object_template_without_document() {
    let context = Context::from_iter([("region", "eu")]);
    let value = Value::Object(
        [
            ("host", Value::from("${name}.${region}")),
            ("name", Value::from("db")),
            ("ports", Value::from(vec![5432i64])),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect(),
    );

    let rendered = ObjectTemplate::new(&context).render(&value).unwrap();
    assert_eq!(rendered.as_object().unwrap()["host"], Value::from("db.eu"));
    assert_eq!(rendered.as_object().unwrap()["ports"], Value::from(vec![5432i64]));
}

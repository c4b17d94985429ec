use hcl::{
    eval::{Context, FuncArgs, FuncDef, ParamType},
    Value,
};

pub struct HclFormat;
impl figment::providers::Format for HclFormat {
    type Error = hcl::Error;

    const NAME: &'static str = "HCL";

    fn from_str<'de, T: serde::de::DeserializeOwned>(string: &'de str) -> Result<T, Self::Error> {
        hcl::eval::from_str(string, &hcl_context())
    }
}

fn string_arg(args: &FuncArgs) -> Result<&str, String> {
    args.first()
        .and_then(Value::as_str)
        .ok_or_else(|| "expected a single string argument".to_string())
}

/// `env("NAME")` resolves to the value of an environment variable.
/// The variable must be set, otherwise evaluation fails.
/// ```hcl
/// fetch {
///   user_agent = env("CHAINFIX_USER_AGENT")
/// }
/// ```
fn env_var(args: FuncArgs) -> Result<Value, String> {
    let key = string_arg(&args)?;
    std::env::var(key)
        .map(Value::String)
        .map_err(|_| format!("environment variable {key} not found"))
}

/// `import("other.hcl")` inlines another HCL document as an object.
fn import_file(args: FuncArgs) -> Result<Value, String> {
    let path = string_arg(&args)?;
    if !path.ends_with(".hcl") {
        return Err(format!("file must be a HCL file: {path}"));
    }

    let contents =
        std::fs::read_to_string(path).map_err(|err| format!("cannot read {path}: {err}"))?;

    hcl::from_str(&contents)
        .map(Value::Object)
        .map_err(|err| format!("cannot parse {path}: {err}"))
}

fn hcl_context<'a>() -> Context<'a> {
    let mut context = Context::new();
    context.declare_func("env", FuncDef::builder().param(ParamType::String).build(env_var));
    context.declare_func(
        "import",
        FuncDef::builder().param(ParamType::String).build(import_file),
    );

    context
}

/// HashiCorp Configuration Language (HCL) provider for figment
pub type Hcl = figment::providers::Data<HclFormat>;

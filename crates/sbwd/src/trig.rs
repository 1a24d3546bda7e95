//! The demonstration module: a handful of trigonometric functions.

use sbwrpc::Fault;
use sbwrpc::ManagementPolicy;
use sbwrpc::Value;
use sbwrun::Module;
use sbwrun::ServiceObject;

pub const MODULE_NAME: &str = "edu.demo.trig";

fn unary(f: fn(f64) -> f64) -> impl Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static {
    move |args: Vec<Value>| Ok(Value::Double(f(args[0].as_double()?)))
}

pub async fn module() -> Result<Module, Fault> {
    let mut trig = ServiceObject::new("trig", "Trigonometry", "math/trig").help("Trigonometric functions in radians");
    trig.add_method("double sin(double x)", "Sine of x", unary(f64::sin))?
        .add_method("double cos(double x)", "Cosine of x", unary(f64::cos))?
        .add_method("double tan(double x)", "Tangent of x", unary(f64::tan))?
        .add_method("double asin(double x)", "Arcsine of x", unary(f64::asin))?
        .add_method("double acos(double x)", "Arccosine of x", unary(f64::acos))?
        .add_method("double atan(double x)", "Arctangent of x", unary(f64::atan))?
        .add_method("double atan2(double y, double x)", "Angle of the point (x, y)", |args: Vec<Value>| {
            Ok(Value::Double(args[0].as_double()?.atan2(args[1].as_double()?)))
        })?
        .add_method("double[] sines(double[] xs)", "Sine of every element", |args: Vec<Value>| {
            let xs: sbwrpc::Result<Vec<f64>> = args[0].as_array()?.items().iter().map(Value::as_double).collect();
            Ok(Value::doubles(xs?.into_iter().map(f64::sin))?)
        })?;

    let module = Module::new(MODULE_NAME, "Trig", ManagementPolicy::Unique);
    module.add_service(trig).await?;
    Ok(module)
}

use std::sync::Arc;

use boa_engine::object::FunctionObjectBuilder;
use boa_engine::property::Attribute;
use boa_engine::{js_string, Context, JsNativeError, JsResult, JsString, JsValue, NativeFunction};
use serde_json::Value;

use xcapsule_types::GuestContext;

/// Raw host bindings. The prelude captures them in closures and then removes
/// them from the global object, so guest code only ever sees `dispatch`,
/// `print` and `console`.
pub(crate) const HOST_DISPATCH: &str = "__host_dispatch";
pub(crate) const HOST_WRITE: &str = "__host_write";

/// Register the host bindings into a boa context.
pub fn register_all(context: &mut Context, guest: Arc<GuestContext>) -> JsResult<()> {
    register_write(context, guest.clone())?;
    register_dispatch(context, guest)?;
    Ok(())
}

fn register_write(context: &mut Context, guest: Arc<GuestContext>) -> JsResult<()> {
    // SAFETY: the closure captures an `Arc<GuestContext>` only, which owns no
    // garbage-collected values and therefore needs no tracing.
    let write = unsafe {
        NativeFunction::from_closure(move |_this, args, _ctx| {
            guest.write_stdout(&js_arg_to_string(args.first()));
            Ok(JsValue::undefined())
        })
    };
    register_function(context, HOST_WRITE, 1, write)
}

fn register_dispatch(context: &mut Context, guest: Arc<GuestContext>) -> JsResult<()> {
    // SAFETY: see `register_write`.
    let dispatch = unsafe {
        NativeFunction::from_closure(move |_this, args, _ctx| {
            let name = js_arg_to_string(args.first());
            let raw_args = js_arg_to_string(args.get(1));
            let call_args: Value = if raw_args.is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&raw_args).map_err(|e| {
                    JsNativeError::typ()
                        .with_message(format!("dispatch arguments must be JSON: {}", e))
                })?
            };

            match guest.dispatch(&name, call_args) {
                Ok(result) => {
                    let encoded = serde_json::to_string(&result).map_err(|e| {
                        JsNativeError::typ()
                            .with_message(format!("capability result is not JSON: {}", e))
                    })?;
                    Ok(JsValue::from(js_string!(encoded)))
                }
                Err(err) => Err(JsNativeError::error().with_message(err.to_string()).into()),
            }
        })
    };
    register_function(context, HOST_DISPATCH, 2, dispatch)
}

fn register_function(
    context: &mut Context,
    name: &str,
    length: usize,
    function: NativeFunction,
) -> JsResult<()> {
    let object = FunctionObjectBuilder::new(context.realm(), function)
        .name(JsString::from(name))
        .length(length)
        .constructor(false)
        .build();
    context.register_global_property(JsString::from(name), object, Attribute::all())?;
    Ok(())
}

fn js_arg_to_string(arg: Option<&JsValue>) -> String {
    arg.and_then(|v| v.as_string())
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_default()
}

//! Modeling standard library exposed to scripts

use std::sync::Arc;

use cadex_kernel::{BooleanType, CadKernel, CadResult, Shape, ShapeHash, Transform};
use rhai::{Dynamic, NativeCallContext};

use super::convert::{FnResult, flag, number, points, runtime, shape, shapes, strings, text, vector};
use super::{OpSite, ScriptShared};
use crate::cache::StructuralHasher;

/// Install the standard library into an engine
pub(crate) fn register(engine: &mut rhai::Engine) {
    engine
        .register_type_with_name::<Shape>("Shape")
        .register_fn("to_string", |s: &mut Shape| format!("{}({})", s.kind().name(), s.hash()))
        .register_fn("to_debug", |s: &mut Shape| format!("{:?}", s))
        .register_get("kind", |s: &mut Shape| s.kind().name().to_string());

    register_constructors(engine);
    register_booleans(engine);
    register_transforms(engine);
    register_parameters(engine);
}

/// Fetch the shared state and record the call site
fn enter(ctx: &NativeCallContext, name: &'static str) -> FnResult<Arc<ScriptShared>> {
    let shared = ctx
        .tag()
        .and_then(|tag| tag.clone().try_cast::<Arc<ScriptShared>>())
        .ok_or_else(|| runtime(ctx, "script state is not attached to the engine"))?;
    {
        let mut state = shared.state.lock();
        state.last_op = Some(OpSite {
            name,
            line: ctx.call_position().line(),
        });
        state.operations += 1;
    }
    Ok(shared)
}

/// Build through the cache, consume `inputs` and append the result
fn build(
    ctx: &NativeCallContext,
    shared: &ScriptShared,
    key: ShapeHash,
    inputs: &[Shape],
    make: impl FnOnce(&dyn CadKernel) -> CadResult<Shape>,
) -> FnResult<Shape> {
    let kernel = shared.kernel.as_ref();
    let mut state = shared.state.lock();
    let shape = state
        .cache
        .get_or_try_insert_with(key, || make(kernel))
        .map_err(|e| runtime(ctx, e.to_string()))?;
    state.consume(inputs);
    state.scene.push(shape.clone());
    Ok(shape)
}

fn make_box(
    ctx: &NativeCallContext,
    shared: &ScriptShared,
    size: [&Dynamic; 3],
    centered: bool,
) -> FnResult<Shape> {
    let size = glam::DVec3::new(
        number(ctx, size[0])?,
        number(ctx, size[1])?,
        number(ctx, size[2])?,
    );
    let key = StructuralHasher::new("Box").vector(size).flag(centered).finish();
    build(ctx, shared, key, &[], |k| k.make_box(size, centered))
}

fn make_cylinder(
    ctx: &NativeCallContext,
    shared: &ScriptShared,
    radius: &Dynamic,
    height: &Dynamic,
    centered: bool,
) -> FnResult<Shape> {
    let (radius, height) = (number(ctx, radius)?, number(ctx, height)?);
    let key = StructuralHasher::new("Cylinder")
        .float(radius)
        .float(height)
        .flag(centered)
        .finish();
    build(ctx, shared, key, &[], |k| k.make_cylinder(radius, height, centered))
}

fn register_constructors(engine: &mut rhai::Engine) {
    engine.register_fn(
        "Box",
        |ctx: NativeCallContext, x: Dynamic, y: Dynamic, z: Dynamic| -> FnResult<Shape> {
            let shared = enter(&ctx, "Box")?;
            make_box(&ctx, &shared, [&x, &y, &z], false)
        },
    );
    engine.register_fn(
        "Box",
        |ctx: NativeCallContext, x: Dynamic, y: Dynamic, z: Dynamic, centered: Dynamic| -> FnResult<Shape> {
            let shared = enter(&ctx, "Box")?;
            let centered = flag(&ctx, &centered)?;
            make_box(&ctx, &shared, [&x, &y, &z], centered)
        },
    );

    engine.register_fn("Sphere", |ctx: NativeCallContext, radius: Dynamic| -> FnResult<Shape> {
        let shared = enter(&ctx, "Sphere")?;
        let radius = number(&ctx, &radius)?;
        let key = StructuralHasher::new("Sphere").float(radius).finish();
        build(&ctx, &shared, key, &[], |k| k.make_sphere(radius))
    });

    engine.register_fn(
        "Cylinder",
        |ctx: NativeCallContext, radius: Dynamic, height: Dynamic| -> FnResult<Shape> {
            let shared = enter(&ctx, "Cylinder")?;
            make_cylinder(&ctx, &shared, &radius, &height, false)
        },
    );
    engine.register_fn(
        "Cylinder",
        |ctx: NativeCallContext, radius: Dynamic, height: Dynamic, centered: Dynamic| -> FnResult<Shape> {
            let shared = enter(&ctx, "Cylinder")?;
            let centered = flag(&ctx, &centered)?;
            make_cylinder(&ctx, &shared, &radius, &height, centered)
        },
    );

    engine.register_fn(
        "Cone",
        |ctx: NativeCallContext, r1: Dynamic, r2: Dynamic, height: Dynamic| -> FnResult<Shape> {
            let shared = enter(&ctx, "Cone")?;
            let (r1, r2, height) = (number(&ctx, &r1)?, number(&ctx, &r2)?, number(&ctx, &height)?);
            let key = StructuralHasher::new("Cone").float(r1).float(r2).float(height).finish();
            build(&ctx, &shared, key, &[], |k| k.make_cone(r1, r2, height))
        },
    );

    engine.register_fn("Polygon", |ctx: NativeCallContext, pts: Dynamic| -> FnResult<Shape> {
        let shared = enter(&ctx, "Polygon")?;
        let pts = points(&ctx, pts)?;
        let key = pts
            .iter()
            .fold(StructuralHasher::new("Polygon").int(pts.len() as i64), |h, p| h.vector(*p))
            .finish();
        build(&ctx, &shared, key, &[], |k| k.make_polygon(&pts))
    });

    engine.register_fn(
        "Extrude",
        |ctx: NativeCallContext, face: Dynamic, direction: Dynamic| -> FnResult<Shape> {
            let shared = enter(&ctx, "Extrude")?;
            let face = shape(&ctx, face)?;
            let direction = vector(&ctx, direction)?;
            let key = StructuralHasher::new("Extrude")
                .shape(face.hash())
                .vector(direction)
                .finish();
            build(&ctx, &shared, key, std::slice::from_ref(&face), |k| k.extrude(&face, direction))
        },
    );
}

/// Fold a boolean over a list, left to right
fn fold_boolean(
    ctx: &NativeCallContext,
    shared: &ScriptShared,
    name: &'static str,
    op: BooleanType,
    first: Shape,
    rest: Vec<Shape>,
) -> FnResult<Shape> {
    let mut acc = first;
    for tool in rest {
        let key = StructuralHasher::new(name)
            .shape(acc.hash())
            .shape(tool.hash())
            .finish();
        let inputs = [acc.clone(), tool.clone()];
        acc = build(ctx, shared, key, &inputs, |k| k.boolean(&acc, &tool, op))?;
    }
    Ok(acc)
}

fn combine_list(ctx: &NativeCallContext, name: &'static str, op: BooleanType, list: Dynamic) -> FnResult<Shape> {
    let shared = enter(ctx, name)?;
    let mut list = shapes(ctx, list)?.into_iter();
    let first = list
        .next()
        .ok_or_else(|| runtime(ctx, format!("{name} needs at least one shape")))?;
    fold_boolean(ctx, &shared, name, op, first, list.collect())
}

fn register_booleans(engine: &mut rhai::Engine) {
    engine.register_fn("Union", |ctx: NativeCallContext, list: Dynamic| -> FnResult<Shape> {
        combine_list(&ctx, "Union", BooleanType::Union, list)
    });
    engine.register_fn("Intersection", |ctx: NativeCallContext, list: Dynamic| -> FnResult<Shape> {
        combine_list(&ctx, "Intersection", BooleanType::Intersect, list)
    });
    engine.register_fn(
        "Difference",
        |ctx: NativeCallContext, body: Dynamic, tools: Dynamic| -> FnResult<Shape> {
            let shared = enter(&ctx, "Difference")?;
            let body = shape(&ctx, body)?;
            let tools = shapes(&ctx, tools)?;
            fold_boolean(&ctx, &shared, "Difference", BooleanType::Subtract, body, tools)
        },
    );
}

fn apply_transform(
    ctx: &NativeCallContext,
    shared: &ScriptShared,
    target: Dynamic,
    transform: Transform,
    key: StructuralHasher,
) -> FnResult<Shape> {
    let target = shape(ctx, target)?;
    let key = key.shape(target.hash()).finish();
    build(ctx, shared, key, std::slice::from_ref(&target), |k| k.transform(&target, &transform))
}

fn register_transforms(engine: &mut rhai::Engine) {
    engine.register_fn(
        "Translate",
        |ctx: NativeCallContext, offset: Dynamic, target: Dynamic| -> FnResult<Shape> {
            let shared = enter(&ctx, "Translate")?;
            let offset = vector(&ctx, offset)?;
            let key = StructuralHasher::new("Translate").vector(offset);
            apply_transform(&ctx, &shared, target, Transform::Translate(offset), key)
        },
    );
    engine.register_fn(
        "Rotate",
        |ctx: NativeCallContext, axis: Dynamic, degrees: Dynamic, target: Dynamic| -> FnResult<Shape> {
            let shared = enter(&ctx, "Rotate")?;
            let axis = vector(&ctx, axis)?;
            let degrees = number(&ctx, &degrees)?;
            let key = StructuralHasher::new("Rotate").vector(axis).float(degrees);
            apply_transform(&ctx, &shared, target, Transform::Rotate { axis, degrees }, key)
        },
    );
    engine.register_fn(
        "Scale",
        |ctx: NativeCallContext, factor: Dynamic, target: Dynamic| -> FnResult<Shape> {
            let shared = enter(&ctx, "Scale")?;
            let factor = number(&ctx, &factor)?;
            let key = StructuralHasher::new("Scale").float(factor);
            apply_transform(&ctx, &shared, target, Transform::Scale(factor), key)
        },
    );
    engine.register_fn(
        "Mirror",
        |ctx: NativeCallContext, normal: Dynamic, target: Dynamic| -> FnResult<Shape> {
            let shared = enter(&ctx, "Mirror")?;
            let normal = vector(&ctx, normal)?;
            let key = StructuralHasher::new("Mirror").vector(normal);
            apply_transform(&ctx, &shared, target, Transform::Mirror(normal), key)
        },
    );
}

fn slider(
    ctx: &NativeCallContext,
    name: Dynamic,
    bounds: [&Dynamic; 3],
    step: Option<&Dynamic>,
) -> FnResult<f64> {
    let shared = enter(ctx, "Slider")?;
    let name = text(ctx, name)?;
    let [default, min, max] = [number(ctx, bounds[0])?, number(ctx, bounds[1])?, number(ctx, bounds[2])?];
    let step = step.map(|s| number(ctx, s)).transpose()?;
    let value = shared
        .state
        .lock()
        .params
        .slider(&name, default, min, max, step)
        .map_err(|e| runtime(ctx, e.to_string()))?;
    Ok(value)
}

fn register_parameters(engine: &mut rhai::Engine) {
    engine.register_fn(
        "Slider",
        |ctx: NativeCallContext, name: Dynamic, default: Dynamic, min: Dynamic, max: Dynamic| -> FnResult<f64> {
            slider(&ctx, name, [&default, &min, &max], None)
        },
    );
    engine.register_fn(
        "Slider",
        |ctx: NativeCallContext,
         name: Dynamic,
         default: Dynamic,
         min: Dynamic,
         max: Dynamic,
         step: Dynamic|
         -> FnResult<f64> { slider(&ctx, name, [&default, &min, &max], Some(&step)) },
    );

    engine.register_fn(
        "Checkbox",
        |ctx: NativeCallContext, name: Dynamic, default: Dynamic| -> FnResult<bool> {
            let shared = enter(&ctx, "Checkbox")?;
            let name = text(&ctx, name)?;
            let default = flag(&ctx, &default)?;
            let value = shared.state.lock().params.checkbox(&name, default);
            value.map_err(|e| runtime(&ctx, e.to_string()))
        },
    );

    engine.register_fn(
        "TextInput",
        |ctx: NativeCallContext, name: Dynamic, default: Dynamic| -> FnResult<String> {
            let shared = enter(&ctx, "TextInput")?;
            let name = text(&ctx, name)?;
            let default = text(&ctx, default)?;
            let value = shared.state.lock().params.text_input(&name, &default);
            value.map_err(|e| runtime(&ctx, e.to_string()))
        },
    );

    engine.register_fn(
        "Dropdown",
        |ctx: NativeCallContext, name: Dynamic, default: Dynamic, options: Dynamic| -> FnResult<String> {
            let shared = enter(&ctx, "Dropdown")?;
            let name = text(&ctx, name)?;
            let default = text(&ctx, default)?;
            let options = strings(&ctx, options)?;
            let value = shared.state.lock().params.dropdown(&name, &default, options);
            value.map_err(|e| runtime(&ctx, e.to_string()))
        },
    );

    engine.register_fn("Button", |ctx: NativeCallContext, name: Dynamic| -> FnResult<bool> {
        let shared = enter(&ctx, "Button")?;
        let name = text(&ctx, name)?;
        let value = shared.state.lock().params.button(&name);
        value.map_err(|e| runtime(&ctx, e.to_string()))
    });
}

#[cfg(test)]
mod tests {
    use super::super::ScriptEngine;
    use crate::config::ScriptConfig;
    use crate::params::{Control, ParamValue};
    use cadex_kernel::{ShapeKind, TruckKernel};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn engine() -> ScriptEngine {
        ScriptEngine::new(Arc::new(TruckKernel::new()), &ScriptConfig::default(), Arc::new(|_| {}))
    }

    #[test]
    fn test_integers_and_floats_accepted() {
        let engine = engine();
        let summary = engine
            .run("Box(1, 2.5, 3); Cylinder(1.0, 2); Cone(2, 0, 3.5);", BTreeMap::new())
            .unwrap();
        assert_eq!(summary.shapes, 3);
    }

    #[test]
    fn test_polygon_extrude_consumes_face() {
        let engine = engine();
        let code = r#"
            let face = Polygon([[0, 0, 0], [4, 0, 0], [4, 2, 0], [0, 2, 0]]);
            Extrude(face, [0, 0, 3]);
        "#;
        engine.run(code, BTreeMap::new()).unwrap();
        let scene = engine.scene();
        assert_eq!(scene.len(), 1);
        assert_eq!(scene[0].kind(), ShapeKind::Solid);
    }

    #[test]
    fn test_union_of_list() {
        let engine = engine();
        let code = r#"
            let parts = [];
            for i in 0..3 {
                parts.push(Translate([i * 0.4, i * 0.1, i * 0.1], Box(1, 1, 1)));
            }
            Union(parts);
        "#;
        engine.run(code, BTreeMap::new()).unwrap();
        assert_eq!(engine.scene().len(), 1);
    }

    #[test]
    fn test_intersection_and_single_tool_difference() {
        let engine = engine();
        let code = r#"
            let a = Intersection([Box(2, 2, 2, true), Sphere(1.2)]);
            let b = Difference(Translate([5, 0, 0], Box(2, 2, 2)), Translate([6, 1, 2], Sphere(0.5)));
            let c = Mirror([1, 0, 0], Scale(2, Rotate([0, 0, 1], 45, b)));
        "#;
        engine.run(code, BTreeMap::new()).unwrap();
        assert_eq!(engine.scene().len(), 2);
    }

    #[test]
    fn test_type_errors() {
        let engine = engine();
        let err = engine.run(r#"Box("a", 1, 1);"#, BTreeMap::new()).unwrap_err();
        assert_eq!(err.operation.as_deref(), Some("Box"));

        let err = engine.run("Translate([1, 2], Box(1, 1, 1));", BTreeMap::new()).unwrap_err();
        assert_eq!(err.operation.as_deref(), Some("Translate"));

        let err = engine.run("Union([]);", BTreeMap::new()).unwrap_err();
        assert!(err.message.contains("at least one"));
    }

    #[test]
    fn test_parameter_controls() {
        let engine = engine();
        let code = r#"
            let label = TextInput("Label", "part");
            let finish = Dropdown("Finish", "matte", ["matte", "gloss"]);
            let pressed = Button("Regenerate");
            let t = Slider("Thickness", 2, 1, 5, 0.5);
            if pressed { Box(t, t, t) }
        "#;
        engine.run(code, BTreeMap::new()).unwrap();
        let params = engine.parameters();
        assert_eq!(params.len(), 4);
        assert_eq!(params["Label"].value, ParamValue::Text("part".into()));
        assert_eq!(params["Regenerate"].control, Control::Button);
        assert!(engine.scene().is_empty());

        let overrides = BTreeMap::from([
            ("Finish".to_string(), ParamValue::Text("chrome".into())),
            ("Regenerate".to_string(), ParamValue::Bool(true)),
        ]);
        engine.run(code, overrides).unwrap();
        assert_eq!(engine.parameters()["Finish"].value, ParamValue::Text("matte".into()));
        assert_eq!(engine.scene().len(), 1);

        engine.run(code, BTreeMap::new()).unwrap();
        assert_eq!(engine.parameters()["Regenerate"].value, ParamValue::Bool(false));
    }

    #[test]
    fn test_invalid_slider_is_error() {
        let engine = engine();
        let err = engine.run(r#"Slider("x", 1, 5, 0);"#, BTreeMap::new()).unwrap_err();
        assert_eq!(err.operation.as_deref(), Some("Slider"));
        assert!(err.message.contains("invalid range"));
    }
}

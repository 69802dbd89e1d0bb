//! Stimulus plugins written as Rhai scripts.
//!
//! A script declares itself through `describe()` and may define the entry
//! points below. Plugin state is an object map bound as `this` for every
//! call, so scripts keep their state in `this.field` rather than globals.
//!
//! ```rhai
//! fn describe() {
//!     #{ name: "Example", topics: [#{ topic: "level", message_type: "std_msgs/Float32" }] }
//! }
//! fn init() { this.level = 0.0; }
//! fn receive(topic, msg) { this.level = msg.data; }
//! fn update(time, x, y, z) { }
//! fn scene() { #{ background: [this.level, this.level, this.level, 1.0], primitives: [] } }
//! fn hud() { [] }
//! ```

use std::path::Path;

use glam::{Quat, Vec3};
use rhai::{Array, CallFnOptions, Dynamic, Engine, EvalAltResult, FuncArgs, Map, Scope, AST, FLOAT};
use serde::Deserialize;

use super::scene::{HudElement, HudLayer, WorldScene};
use super::{StimulusPlugin, TopicDeclaration};

/// Self-description returned by a script's `describe()`.
#[derive(Debug, Deserialize)]
struct ScriptDescription {
    name: String,
    #[serde(default)]
    topics: Vec<TopicDeclaration>,
}

/// Entry points a script may define, checked once after compilation.
#[derive(Debug, Clone, Copy, Default)]
struct EntryPoints {
    init: bool,
    receive: bool,
    update: bool,
    scene: bool,
    hud: bool,
}

impl EntryPoints {
    fn scan(ast: &AST) -> Self {
        let has = |name: &str, arity: usize| {
            ast.iter_functions()
                .any(|f| f.name == name && f.params.len() == arity)
        };
        Self {
            init: has("init", 0),
            receive: has("receive", 2),
            update: has("update", 4),
            scene: has("scene", 0),
            hud: has("hud", 0),
        }
    }
}

/// A stimulus backed by a compiled Rhai script.
pub struct ScriptStimulus {
    name: String,
    topics: Vec<TopicDeclaration>,
    engine: Engine,
    ast: AST,
    scope: Scope<'static>,
    state: Dynamic,
    entry: EntryPoints,
    world: WorldScene,
    hud: HudLayer,
}

impl ScriptStimulus {
    /// Compile and describe the script at `path`.
    pub fn load(path: &Path) -> Result<Self, String> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::from_source(&source)
    }

    pub fn from_source(source: &str) -> Result<Self, String> {
        let engine = sandboxed_engine();
        let ast = engine
            .compile(source)
            .map_err(|e| format!("compile error: {}", e))?;

        let mut scope = Scope::new();
        engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|e| format!("script error: {}", e))?;

        let entry = EntryPoints::scan(&ast);
        let mut state = Dynamic::from_map(Map::new());

        let description = call_script(&engine, &ast, &mut scope, &mut state, "describe", ())
            .map_err(|e| format!("describe() failed: {}", e))?;
        let description: ScriptDescription = dynamic_to_json(description)
            .and_then(|v| serde_json::from_value(v).map_err(|e| e.to_string()))
            .map_err(|e| format!("invalid describe() result: {}", e))?;
        if description.name.trim().is_empty() {
            return Err("describe() returned an empty name".to_string());
        }

        let mut stimulus = Self {
            name: description.name,
            topics: description.topics,
            engine,
            ast,
            scope,
            state,
            entry,
            world: WorldScene::default(),
            hud: HudLayer::default(),
        };

        if stimulus.entry.init {
            stimulus
                .call("init", ())
                .map(|_| ())
                .map_err(|e| format!("init() failed: {}", e))?;
        }
        stimulus.refresh_content();
        Ok(stimulus)
    }

    /// The script's state map, as seen by `this`.
    pub fn state(&self) -> &Dynamic {
        &self.state
    }

    fn call(&mut self, name: &str, args: impl FuncArgs) -> Result<Dynamic, Box<EvalAltResult>> {
        call_script(
            &self.engine,
            &self.ast,
            &mut self.scope,
            &mut self.state,
            name,
            args,
        )
    }

    /// Re-evaluate `scene()` and `hud()`. A failing call keeps the previous
    /// content so a transient script error does not blank the display.
    fn refresh_content(&mut self) {
        if self.entry.scene {
            match self
                .call("scene", ())
                .map_err(|e| e.to_string())
                .and_then(dynamic_to_json)
                .and_then(|v| serde_json::from_value::<WorldScene>(v).map_err(|e| e.to_string()))
            {
                Ok(world) => self.world = world,
                Err(e) => log::warn!("[{}] scene() failed: {}", self.name, e),
            }
        }
        if self.entry.hud {
            match self
                .call("hud", ())
                .map_err(|e| e.to_string())
                .and_then(dynamic_to_json)
                .and_then(|v| {
                    serde_json::from_value::<Vec<HudElement>>(v).map_err(|e| e.to_string())
                }) {
                Ok(elements) => self.hud = HudLayer { elements },
                Err(e) => log::warn!("[{}] hud() failed: {}", self.name, e),
            }
        }
    }
}

impl StimulusPlugin for ScriptStimulus {
    fn name(&self) -> &str {
        &self.name
    }

    fn topics(&self) -> &[TopicDeclaration] {
        &self.topics
    }

    fn receive_json_message(&mut self, topic: &str, json: &str) -> anyhow::Result<()> {
        if !self.entry.receive {
            return Ok(());
        }
        let payload: serde_json::Value = serde_json::from_str(json)?;
        self.call("receive", (topic.to_string(), json_to_dynamic(&payload)))
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("receive() failed: {}", e))
    }

    fn update(&mut self, time: f64, position: Vec3, _orientation: Quat) {
        if self.entry.update {
            let args = (time as FLOAT, position.x, position.y, position.z);
            if let Err(e) = self.call("update", args) {
                log::warn!("[{}] update() failed: {}", self.name, e);
            }
        }
        self.refresh_content();
    }

    fn world(&self) -> &WorldScene {
        &self.world
    }

    fn hud(&self) -> &HudLayer {
        &self.hud
    }
}

fn sandboxed_engine() -> Engine {
    let mut engine = Engine::new();

    engine.set_max_expr_depths(64, 64);
    engine.set_max_call_levels(64);
    engine.set_max_operations(100_000);
    engine.set_max_string_size(10_000);
    engine.set_max_array_size(1_000);
    engine.set_max_map_size(500);

    engine.on_print(|text| log::info!("[script] {}", text));
    engine.register_fn("log_warn", |value: Dynamic| {
        log::warn!("[script] {}", value);
    });

    engine
}

fn call_script(
    engine: &Engine,
    ast: &AST,
    scope: &mut Scope<'static>,
    state: &mut Dynamic,
    name: &str,
    args: impl FuncArgs,
) -> Result<Dynamic, Box<EvalAltResult>> {
    let options = CallFnOptions::new().eval_ast(false).bind_this_ptr(state);
    engine.call_fn_with_options(options, scope, ast, name, args)
}

/// Convert a JSON payload into the value handed to `receive()`.
pub fn json_to_dynamic(value: &serde_json::Value) -> Dynamic {
    use serde_json::Value;

    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Dynamic::from(i),
            None => Dynamic::from(n.as_f64().unwrap_or(0.0) as FLOAT),
        },
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => {
            let array: Array = items.iter().map(json_to_dynamic).collect();
            Dynamic::from_array(array)
        }
        Value::Object(fields) => {
            let mut map = Map::new();
            for (key, field) in fields {
                map.insert(key.as_str().into(), json_to_dynamic(field));
            }
            Dynamic::from_map(map)
        }
    }
}

/// Convert a script result into JSON so serde can shape it.
pub fn dynamic_to_json(value: Dynamic) -> Result<serde_json::Value, String> {
    use serde_json::Value;

    if value.is_unit() {
        return Ok(Value::Null);
    }
    if let Ok(b) = value.as_bool() {
        return Ok(Value::Bool(b));
    }
    if let Ok(i) = value.as_int() {
        return Ok(Value::from(i));
    }
    if let Ok(f) = value.as_float() {
        return serde_json::Number::from_f64(f as f64)
            .map(Value::Number)
            .ok_or_else(|| format!("non-finite number {}", f));
    }
    if value.is_string() {
        return value
            .into_string()
            .map(Value::String)
            .map_err(|t| format!("expected string, got {}", t));
    }
    if value.is_array() {
        let items = value
            .into_array()
            .map_err(|t| format!("expected array, got {}", t))?;
        return items
            .into_iter()
            .map(dynamic_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array);
    }
    if value.is_map() {
        let type_name = value.type_name();
        let map = value
            .try_cast::<Map>()
            .ok_or_else(|| format!("expected map, got {}", type_name))?;
        let mut fields = serde_json::Map::new();
        for (key, field) in map {
            fields.insert(key.to_string(), dynamic_to_json(field)?);
        }
        return Ok(Value::Object(fields));
    }
    Err(format!("unsupported script value of type {}", value.type_name()))
}

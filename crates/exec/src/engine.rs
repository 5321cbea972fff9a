//! Engine construction and namespace injection for host-side execution.
//!
//! The four namespaces are value objects seeded into the scope and
//! resolvable by name everywhere via the variable resolver. Their
//! methods bridge into the async resource layer with `Handle::block_on`,
//! which is legal here because evaluation always runs on a blocking
//! worker thread, never on the async executor.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use rhai::{Dynamic, Engine, EvalAltResult, Position, Scope};
use tokio::runtime::Handle;

use cm_domain::artifact::ArtifactData;
use cm_domain::error::Result;

use crate::resources::Resources;
use crate::value::{dynamic_to_json, json_to_dynamic};

/// Shared context every namespace closure captures.
#[derive(Clone)]
pub struct NsContext {
    pub resources: Arc<Resources>,
    pub handle: Handle,
    /// Captured interpreter stdout (`print` output).
    pub print: Arc<Mutex<String>>,
    /// Module directory for `import` resolution, when deps are enabled.
    pub modules_dir: Option<PathBuf>,
}

impl NsContext {
    pub fn new(resources: Arc<Resources>, handle: Handle, modules_dir: Option<PathBuf>) -> Self {
        Self {
            resources,
            handle,
            print: Arc::new(Mutex::new(String::new())),
            modules_dir,
        }
    }

    pub fn take_stdout(&self) -> String {
        std::mem::take(&mut *self.print.lock())
    }
}

fn rt_err(message: impl std::fmt::Display) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(message.to_string()),
        Position::NONE,
    ))
}

fn block_on<T>(
    ctx: &NsContext,
    fut: impl std::future::Future<Output = Result<T>>,
) -> std::result::Result<T, Box<EvalAltResult>> {
    ctx.handle.block_on(fut).map_err(rt_err)
}

fn map_to_json(map: &rhai::Map) -> serde_json::Value {
    serde_json::Value::Object(
        map.iter()
            .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
            .collect(),
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Namespace values
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct ToolsNs {
    ctx: NsContext,
}

impl ToolsNs {
    fn call(
        &self,
        name: &str,
        callable: Option<&str>,
        args: serde_json::Value,
    ) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        let value = block_on(
            &self.ctx,
            self.ctx.resources.registry.call_tool(name, callable, &args),
        )?;
        Ok(json_to_dynamic(&value))
    }

    fn list(&self) -> Dynamic {
        let tools = self.ctx.resources.registry.list_tools(None);
        json_to_dynamic(&serde_json::Value::Array(
            tools.iter().map(|t| t.summary()).collect(),
        ))
    }

    fn search(&self, query: &str, limit: usize) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        let tools = block_on(&self.ctx, self.ctx.resources.registry.search(query, limit))?;
        Ok(json_to_dynamic(&serde_json::Value::Array(
            tools.iter().map(|t| t.summary()).collect(),
        )))
    }

    fn recipes(&self, name: &str) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        let callables = self.ctx.resources.registry.recipes(name).map_err(rt_err)?;
        let json = serde_json::to_value(&callables).map_err(rt_err)?;
        Ok(json_to_dynamic(&json))
    }
}

#[derive(Clone)]
pub struct SkillsNs {
    ctx: NsContext,
}

impl SkillsNs {
    fn list(&self) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        let skills = block_on(&self.ctx, self.ctx.resources.skills.list())?;
        Ok(json_to_dynamic(&serde_json::Value::Array(
            skills.iter().map(|s| s.summary()).collect(),
        )))
    }

    fn search(&self, query: &str, limit: usize) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        let skills = block_on(&self.ctx, self.ctx.resources.skills.search(query, limit))?;
        Ok(json_to_dynamic(&serde_json::Value::Array(
            skills.iter().map(|s| s.summary()).collect(),
        )))
    }

    fn get(&self, name: &str) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        let skill = block_on(&self.ctx, self.ctx.resources.skills.get(name))?;
        Ok(match skill {
            Some(s) => json_to_dynamic(&s.summary()),
            None => Dynamic::UNIT,
        })
    }

    fn create(
        &self,
        name: &str,
        source: &str,
        description: &str,
    ) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        let skill = block_on(
            &self.ctx,
            self.ctx.resources.skills.create(name, source, description),
        )?;
        Ok(json_to_dynamic(&skill.summary()))
    }

    fn delete(&self, name: &str) -> std::result::Result<bool, Box<EvalAltResult>> {
        block_on(&self.ctx, self.ctx.resources.skills.remove(name))
    }

    fn invoke(
        &self,
        name: &str,
        args: rhai::Map,
    ) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        invoke_skill_sync(&self.ctx, name, &args)
    }
}

#[derive(Clone)]
pub struct ArtifactsNs {
    ctx: NsContext,
}

impl ArtifactsNs {
    fn list(&self) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        let metas = block_on(&self.ctx, self.ctx.resources.artifacts.list())?;
        let json = serde_json::to_value(&metas).map_err(rt_err)?;
        Ok(json_to_dynamic(&json))
    }

    fn load(&self, name: &str) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        let data = block_on(&self.ctx, self.ctx.resources.artifacts.load(name))?;
        Ok(match data {
            ArtifactData::Bytes(b) => Dynamic::from_blob(b),
            ArtifactData::Text(s) => Dynamic::from(s),
            ArtifactData::Json(v) => json_to_dynamic(&v),
        })
    }

    fn save(
        &self,
        name: &str,
        data: Dynamic,
        description: &str,
        metadata: rhai::Map,
    ) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        let payload = if let Some(blob) = data.clone().try_cast::<rhai::Blob>() {
            ArtifactData::Bytes(blob)
        } else if let Some(s) = data.clone().try_cast::<rhai::ImmutableString>() {
            ArtifactData::Text(s.to_string())
        } else {
            ArtifactData::Json(dynamic_to_json(&data))
        };
        let metadata = match map_to_json(&metadata) {
            serde_json::Value::Object(m) => m.into_iter().collect(),
            _ => Default::default(),
        };
        block_on(
            &self.ctx,
            self.ctx
                .resources
                .artifacts
                .save(name, payload, description, metadata),
        )?;
        Ok(Dynamic::UNIT)
    }

    fn delete(&self, name: &str) -> std::result::Result<bool, Box<EvalAltResult>> {
        block_on(&self.ctx, self.ctx.resources.artifacts.delete(name))
    }

    fn exists(&self, name: &str) -> std::result::Result<bool, Box<EvalAltResult>> {
        block_on(&self.ctx, self.ctx.resources.artifacts.exists(name))
    }

    fn path(&self) -> String {
        self.ctx.resources.artifacts.display_path()
    }
}

#[derive(Clone)]
pub struct DepsNs {
    ctx: NsContext,
}

impl DepsNs {
    fn list(&self) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        let deps = block_on(&self.ctx, self.ctx.resources.deps.list())?;
        Ok(json_to_dynamic(&serde_json::json!(deps)))
    }

    fn add(&self, package: &str) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        let report = block_on(&self.ctx, self.ctx.resources.deps.add_runtime(package))?;
        let json = serde_json::to_value(&report).map_err(rt_err)?;
        Ok(json_to_dynamic(&json))
    }

    fn remove(&self, package: &str) -> std::result::Result<bool, Box<EvalAltResult>> {
        block_on(&self.ctx, self.ctx.resources.deps.remove_runtime(package))
    }

    fn sync(&self) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        let report = block_on(&self.ctx, self.ctx.resources.deps.sync())?;
        let json = serde_json::to_value(&report).map_err(rt_err)?;
        Ok(json_to_dynamic(&json))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build an engine with print capture, module resolution, and the four
/// namespace types registered.
pub fn build_engine(ctx: &NsContext) -> Engine {
    let mut engine = Engine::new();

    let print = ctx.print.clone();
    engine.on_print(move |text| {
        let mut buf = print.lock();
        buf.push_str(text);
        buf.push('\n');
    });
    let debug = ctx.print.clone();
    engine.on_debug(move |text, _source, _pos| {
        let mut buf = debug.lock();
        buf.push_str(text);
        buf.push('\n');
    });

    if let Some(dir) = &ctx.modules_dir {
        engine.set_module_resolver(rhai::module_resolvers::FileModuleResolver::new_with_path(
            dir,
        ));
    }

    // Script functions cannot see scope variables; the resolver makes the
    // namespaces reachable from inside `fn` bodies (skills included).
    let resolver_ctx = ctx.clone();
    engine.on_var(move |name, _index, _context| {
        Ok(match name {
            "tools" => Some(Dynamic::from(ToolsNs {
                ctx: resolver_ctx.clone(),
            })),
            "skills" => Some(Dynamic::from(SkillsNs {
                ctx: resolver_ctx.clone(),
            })),
            "artifacts" => Some(Dynamic::from(ArtifactsNs {
                ctx: resolver_ctx.clone(),
            })),
            "deps" => Some(Dynamic::from(DepsNs {
                ctx: resolver_ctx.clone(),
            })),
            _ => None,
        })
    });

    engine
        .register_type_with_name::<ToolsNs>("tools")
        .register_fn("call", |ns: &mut ToolsNs, name: &str| {
            ns.call(name, None, serde_json::json!({}))
        })
        .register_fn("call", |ns: &mut ToolsNs, name: &str, args: rhai::Map| {
            ns.call(name, None, map_to_json(&args))
        })
        .register_fn(
            "invoke",
            |ns: &mut ToolsNs, name: &str, recipe: &str| {
                ns.call(name, Some(recipe), serde_json::json!({}))
            },
        )
        .register_fn(
            "invoke",
            |ns: &mut ToolsNs, name: &str, recipe: &str, args: rhai::Map| {
                ns.call(name, Some(recipe), map_to_json(&args))
            },
        )
        .register_fn("list", |ns: &mut ToolsNs| ns.list())
        .register_fn("search", |ns: &mut ToolsNs, query: &str| ns.search(query, 10))
        .register_fn("search", |ns: &mut ToolsNs, query: &str, limit: i64| {
            ns.search(query, limit.max(0) as usize)
        })
        .register_fn("recipes", |ns: &mut ToolsNs, name: &str| ns.recipes(name));

    engine
        .register_type_with_name::<SkillsNs>("skills")
        .register_fn("list", |ns: &mut SkillsNs| ns.list())
        .register_fn("search", |ns: &mut SkillsNs, query: &str| ns.search(query, 5))
        .register_fn("search", |ns: &mut SkillsNs, query: &str, limit: i64| {
            ns.search(query, limit.max(0) as usize)
        })
        .register_fn("get", |ns: &mut SkillsNs, name: &str| ns.get(name))
        .register_fn(
            "create",
            |ns: &mut SkillsNs, name: &str, source: &str, description: &str| {
                ns.create(name, source, description)
            },
        )
        .register_fn("create", |ns: &mut SkillsNs, name: &str, source: &str| {
            ns.create(name, source, "")
        })
        .register_fn("delete", |ns: &mut SkillsNs, name: &str| ns.delete(name))
        .register_fn("invoke", |ns: &mut SkillsNs, name: &str| {
            ns.invoke(name, rhai::Map::new())
        })
        .register_fn("invoke", |ns: &mut SkillsNs, name: &str, args: rhai::Map| {
            ns.invoke(name, args)
        });

    engine
        .register_type_with_name::<ArtifactsNs>("artifacts")
        .register_fn("list", |ns: &mut ArtifactsNs| ns.list())
        .register_fn("load", |ns: &mut ArtifactsNs, name: &str| ns.load(name))
        .register_fn("save", |ns: &mut ArtifactsNs, name: &str, data: Dynamic| {
            ns.save(name, data, "", rhai::Map::new())
        })
        .register_fn(
            "save",
            |ns: &mut ArtifactsNs, name: &str, data: Dynamic, description: &str| {
                ns.save(name, data, description, rhai::Map::new())
            },
        )
        .register_fn(
            "save",
            |ns: &mut ArtifactsNs, name: &str, data: Dynamic, description: &str, metadata: rhai::Map| {
                ns.save(name, data, description, metadata)
            },
        )
        .register_fn("delete", |ns: &mut ArtifactsNs, name: &str| ns.delete(name))
        .register_fn("exists", |ns: &mut ArtifactsNs, name: &str| ns.exists(name))
        .register_get("path", |ns: &mut ArtifactsNs| ns.path());

    engine
        .register_type_with_name::<DepsNs>("deps")
        .register_fn("list", |ns: &mut DepsNs| ns.list())
        .register_fn("add", |ns: &mut DepsNs, package: &str| ns.add(package))
        .register_fn("remove", |ns: &mut DepsNs, package: &str| ns.remove(package))
        .register_fn("sync", |ns: &mut DepsNs| ns.sync());

    engine
}

/// Seed the four namespaces into a scope. Methods take `&mut` receivers,
/// so these are plain variables, not constants.
pub fn seed_scope(scope: &mut Scope<'static>, ctx: &NsContext) {
    scope.push("tools", ToolsNs { ctx: ctx.clone() });
    scope.push("skills", SkillsNs { ctx: ctx.clone() });
    scope.push("artifacts", ArtifactsNs { ctx: ctx.clone() });
    scope.push("deps", DepsNs { ctx: ctx.clone() });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Skill invocation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run a skill's source fresh in its own engine and call `run` with the
/// named args mapped to positional parameters.
///
/// Every invocation gets a clean scope seeded with the same namespaces,
/// so skills can call tools and other skills.
pub fn invoke_skill_sync(
    ctx: &NsContext,
    name: &str,
    args: &rhai::Map,
) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
    let skill = ctx
        .handle
        .block_on(ctx.resources.skills.require(name))
        .map_err(rt_err)?;

    let engine = build_engine(ctx);
    let ast = engine
        .compile(&skill.source)
        .map_err(|e| rt_err(format!("skill '{name}' failed to compile: {e}")))?;

    let mut call_args: Vec<Dynamic> = Vec::with_capacity(skill.parameters.len());
    for param in &skill.parameters {
        let value = args.get(param.name.as_str()).cloned().ok_or_else(|| {
            rt_err(format!("skill '{name}' missing argument '{}'", param.name))
        })?;
        call_args.push(value);
    }

    let mut scope = Scope::new();
    seed_scope(&mut scope, ctx);
    engine
        .call_fn::<Dynamic>(&mut scope, &ast, "run", call_args)
        .map_err(|e| rt_err(format!("skill '{name}' failed: {e}")))
}

/// Async wrapper over [`invoke_skill_sync`] for host-side RPC dispatch.
pub async fn invoke_skill(
    resources: Arc<Resources>,
    name: &str,
    args: &serde_json::Value,
) -> Result<serde_json::Value> {
    let handle = Handle::current();
    let ctx = NsContext::new(resources, handle, None);
    let name = name.to_string();
    let args_map = match json_to_dynamic(args).try_cast::<rhai::Map>() {
        Some(map) => map,
        None => rhai::Map::new(),
    };
    let result = tokio::task::spawn_blocking(move || {
        invoke_skill_sync(&ctx, &name, &args_map).map(|d| dynamic_to_json(&d))
    })
    .await
    .map_err(|e| cm_domain::error::Error::Internal(format!("skill task panicked: {e}")))?;
    result.map_err(|e| cm_domain::error::Error::call_failed("skill", e.to_string()))
}

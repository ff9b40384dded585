//! # Configuration Module / 配置模块
//!
//! Configuration types for a run: how an isolated host is set up, the
//! document written to its temporary configuration file, run-wide settings,
//! and the TOML plan file consumed by the command-line interface.
//!
//! 一次运行的配置类型：隔离宿主的设置方式、写入其临时配置文件的文档、
//! 运行级设置，以及命令行接口使用的 TOML 计划文件。

use anyhow::{Context, Result, bail};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::core::command_controller::COMMAND_PROPERTY;
use crate::core::controller::{ControllerFactory, ExecutionFactory};
use crate::core::models::{DependencyEdge, NodeSpec};

/// Name of the binding added for the host's own agent executable.
/// 为宿主自身代理可执行文件添加的绑定名称。
pub const AGENT_BINDING: &str = "plan-runner-agent";

static INSTALLATION_PATH: Lazy<PathBuf> = Lazy::new(|| {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
});

static AGENT_EXECUTABLE: Lazy<PathBuf> =
    Lazy::new(|| std::env::current_exe().unwrap_or_else(|_| PathBuf::from("plan-runner")));

/// The directory the coordinator runs from.
/// 协调器运行所在的目录。
pub fn installation_path() -> &'static Path {
    &INSTALLATION_PATH
}

/// The executable started for process and sandbox boundaries.
pub fn agent_executable() -> &'static Path {
    &AGENT_EXECUTABLE
}

/// The isolation mechanism behind an environment.
/// 环境背后的隔离机制。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationKind {
    /// A separate task inside the coordinator process.
    #[default]
    InProcess,
    /// A child process speaking the protocol over stdio.
    Process,
    /// A child process started with a cleared environment.
    Sandbox,
}

/// Maps a module name to the path it is loaded from inside the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleBinding {
    pub name: String,
    pub path: PathBuf,
}

/// The structured configuration document materialised for each environment.
/// 为每个环境具体化的结构化配置文档。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfiguration {
    /// Copy the application base into a scratch directory and run from it.
    pub shadow_copy: bool,
    /// Free-form settings visible to the host.
    pub settings: BTreeMap<String, String>,
    pub bindings: Vec<ModuleBinding>,
}

impl HostConfiguration {
    pub fn add_binding(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.bindings.push(ModuleBinding {
            name: name.into(),
            path: path.into(),
        });
    }

    pub fn binding(&self, name: &str) -> Option<&ModuleBinding> {
        self.bindings.iter().find(|binding| binding.name == name)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }

    /// Reads a configuration file previously written for an environment.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read host configuration at {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse host configuration at {}", path.display()))
    }
}

/// How an isolated environment is provisioned for a master.
/// 为主节点提供隔离环境的方式。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSetup {
    /// Directory the environment runs in. A scratch directory is created
    /// when none is given.
    pub working_directory: Option<PathBuf>,
    /// Directory the host application is loaded from. Defaults to the
    /// coordinator's installation directory.
    pub application_base_directory: Option<PathBuf>,
    pub configuration: HostConfiguration,
    pub isolation: IsolationKind,
}

impl HostSetup {
    pub fn new(isolation: IsolationKind) -> Self {
        Self {
            isolation,
            ..Self::default()
        }
    }

    pub fn with_working_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    pub fn with_application_base(mut self, path: impl Into<PathBuf>) -> Self {
        self.application_base_directory = Some(path.into());
        self
    }

    pub fn with_configuration(mut self, configuration: HostConfiguration) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn application_base(&self) -> &Path {
        self.application_base_directory
            .as_deref()
            .unwrap_or_else(|| installation_path())
    }

    /// The configuration written for the environment. When the host loads
    /// from a directory other than the coordinator's installation directory,
    /// a binding for the agent executable is added so it can still be found.
    pub fn effective_configuration(&self) -> HostConfiguration {
        let mut configuration = self.configuration.clone();
        if self.application_base() != installation_path()
            && configuration.binding(AGENT_BINDING).is_none()
        {
            configuration.add_binding(AGENT_BINDING, agent_executable());
        }
        configuration
    }
}

/// Run-wide settings, read from the `[settings]` table of a plan file.
/// 运行级设置，从计划文件的 `[settings]` 表中读取。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Size of the worker pool.
    pub jobs: usize,
    /// How long in-flight masters may keep running after cancellation.
    pub grace_period_secs: u64,
    pub invoke_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            jobs: num_cpus::get(),
            grace_period_secs: 5,
            invoke_timeout_secs: 300,
            handshake_timeout_secs: 10,
        }
    }
}

impl RunSettings {
    /// Worker pool size, between one and the most permits a semaphore holds.
    pub fn jobs(&self) -> usize {
        self.jobs.clamp(1, Semaphore::MAX_PERMITS)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_secs(self.invoke_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// One node of a plan file. Nodes form a tree through `parent`.
/// 计划文件中的一个节点。节点通过 `parent` 构成树。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Defaults to `true` when the node has a command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Marks the node as a master. Implied by `host`.
    #[serde(default)]
    pub master: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<HostSetup>,
}

impl NodeEntry {
    pub fn is_master(&self) -> bool {
        self.master || self.host.is_some()
    }
}

/// The TOML plan file read by `plan-runner run` and `plan-runner plan`.
/// `plan-runner run` 和 `plan-runner plan` 读取的 TOML 计划文件。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFile {
    #[serde(default)]
    pub settings: RunSettings,
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
}

impl PlanFile {
    /// Loads a plan file. Relative host directories are resolved against the
    /// directory containing the plan file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file at {}", path.display()))?;
        let mut plan: PlanFile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse plan file at {}", path.display()))?;

        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        for host in plan.nodes.iter_mut().filter_map(|node| node.host.as_mut()) {
            for dir in [
                &mut host.working_directory,
                &mut host.application_base_directory,
            ] {
                if let Some(dir) = dir.as_mut().filter(|dir| dir.is_relative()) {
                    *dir = base.join(&*dir);
                }
            }
        }
        Ok(plan)
    }

    /// Assembles the node forest and dependency edges described by the plan.
    /// Every master uses `controller`; nodes with a `host` table run isolated.
    ///
    /// 组装计划描述的节点森林和依赖边。
    /// 每个主节点都使用 `controller`；带有 `host` 表的节点在隔离环境中运行。
    pub fn into_graph_input(
        &self,
        controller: Arc<dyn ControllerFactory>,
    ) -> Result<(Vec<NodeSpec>, Vec<DependencyEdge>)> {
        let mut positions: HashMap<&str, usize> = HashMap::new();
        for (position, node) in self.nodes.iter().enumerate() {
            if positions.insert(node.id.as_str(), position).is_some() {
                bail!("Duplicate node id '{}' in plan file", node.id);
            }
        }

        let mut children: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        let mut roots = Vec::new();
        for (position, node) in self.nodes.iter().enumerate() {
            match node.parent.as_deref() {
                Some(parent) => {
                    let parent_pos = *positions.get(parent).with_context(|| {
                        format!("Node '{}' names unknown parent '{}'", node.id, parent)
                    })?;
                    children[parent_pos].push(position);
                }
                None => roots.push(position),
            }
        }

        let mut built = 0usize;
        let specs = roots
            .iter()
            .map(|&root| self.build_spec(root, &children, &controller, &mut built))
            .collect::<Vec<_>>();
        if built != self.nodes.len() {
            bail!("Parent links in plan file form a cycle");
        }

        let edges = self
            .nodes
            .iter()
            .flat_map(|node| {
                node.dependencies
                    .iter()
                    .map(move |dep| DependencyEdge::new(node.id.as_str(), dep.as_str()))
            })
            .collect();

        Ok((specs, edges))
    }

    fn build_spec(
        &self,
        position: usize,
        children: &[Vec<usize>],
        controller: &Arc<dyn ControllerFactory>,
        built: &mut usize,
    ) -> NodeSpec {
        *built += 1;
        let entry = &self.nodes[position];

        let mut spec = if entry.test_case.unwrap_or(entry.command.is_some()) {
            NodeSpec::test_case(entry.id.as_str())
        } else {
            NodeSpec::container(entry.id.as_str())
        };
        if let Some(command) = &entry.command {
            spec = spec.with_property(COMMAND_PROPERTY, command.as_str());
        }
        if entry.is_master() {
            spec = spec.with_factory(ExecutionFactory {
                controller: Arc::clone(controller),
                isolation: entry.host.clone(),
            });
        }

        let nested: Vec<NodeSpec> = children[position]
            .iter()
            .map(|&child| self.build_spec(child, children, controller, built))
            .collect();
        spec.with_children(nested)
    }
}

//! # wifisim-model
//!
//! YAML scenario loading and simulation building for wifisim.
//!
//! This crate provides:
//! - the YAML scenario schema
//! - loading from files and strings, with merging of several files
//! - building the entities and initial events of a runnable simulation
//!
//! ## Layered parameters
//!
//! PHY and rate parameters are resolved in order: built-in defaults
//! ([`WifiPhyConfig::default`]) → `defaults.phy` / `defaults.rate` → the
//! node's own `phy` / `rate` sections. Nested sections merge key by key.
//!
//! ```yaml
//! simulation:
//!   duration_s: 2.0
//!   seed: 7
//! defaults:
//!   phy:
//!     channel_width_mhz: 40
//!   link:
//!     path_loss_db: 80.0
//! nodes:
//!   - name: ap
//!     phy: { is_ap: true }
//!     agents:
//!       - type: echo
//!   - name: sta
//!     agents:
//!       - { type: ping, target: "02:00:00:00:00:01", count: 5 }
//! links:
//!   - { from: ap, to: sta }
//! ```
//!
//! Nodes without an `address` get `02:00:00:00:xx:yy`, numbered from 1 in
//! name order.

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};
use wifi_ppdu::{MacAddr, ModulationClass};
use wifisim_agents::{create_agent, AgentConfig, AgentError, AttachedPhy};
use wifisim_common::{EntityId, EntityRegistry, Event, EventId, EventPayload, MetricLabels, SimTime};
use wifisim_phy::{
    ConstantRate, ConstantRateConfig, LinkModel, LinkParams, Medium, PhyError, WifiPhy, WifiPhyConfig,
};

/// Entity id of the medium in every built simulation.
pub const MEDIUM_ENTITY: EntityId = EntityId(0);

const DEFAULT_DURATION_S: f64 = 10.0;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while loading or building a model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A node's merged parameters do not form a valid configuration.
    #[error("Invalid node '{node}': {message}")]
    InvalidNode { node: String, message: String },

    #[error("Invalid link: {from} -> {to}")]
    InvalidLink { from: String, to: String },

    #[error("Address {address} is used by both '{first}' and '{second}'")]
    DuplicateAddress {
        address: MacAddr,
        first: String,
        second: String,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("PHY of node '{node}': {source}")]
    Phy {
        node: String,
        #[source]
        source: PhyError,
    },

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
}

// ============================================================================
// Public Model API
// ============================================================================

/// Simulation-wide settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationConfig {
    pub duration_s: f64,
    pub seed: u64,
}

impl SimulationConfig {
    pub fn duration(&self) -> SimTime {
        SimTime::from_secs(self.duration_s)
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            duration_s: DEFAULT_DURATION_S,
            seed: 0,
        }
    }
}

/// A loaded scenario with every node and link fully resolved.
#[derive(Debug, Clone)]
pub struct Model {
    simulation: SimulationConfig,
    nodes: BTreeMap<String, Node>,
    /// Directed links keyed by `(from, to)`.
    links: BTreeMap<(String, String), Link>,
}

impl Model {
    pub fn simulation(&self) -> &SimulationConfig {
        &self.simulation
    }

    pub fn nodes(&self) -> &BTreeMap<String, Node> {
        &self.nodes
    }

    pub fn links(&self) -> &BTreeMap<(String, String), Link> {
        &self.links
    }

    pub fn find_node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn find_link(&self, from: &str, to: &str) -> Option<&Link> {
        self.links.get(&(from.to_string(), to.to_string()))
    }
}

/// A node: one PHY, its rate policy and the agents driving it.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub address: MacAddr,
    pub phy: WifiPhyConfig,
    pub rate: ConstantRateConfig,
    pub agents: Vec<AgentConfig>,
}

/// A directed link.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub from: String,
    pub to: String,
    pub params: LinkParams,
}

// ============================================================================
// YAML Schema Types (Internal)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SimulationYaml {
    duration_s: Option<f64>,
    seed: Option<u64>,
}

/// Link parameters as written; unset fields fall back to `defaults.link`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LinkParamsYaml {
    path_loss_db: Option<f64>,
    shadowing_std_db: Option<f64>,
    delay_us: Option<u64>,
}

impl LinkParamsYaml {
    fn apply(&mut self, overlay: &LinkParamsYaml) {
        self.path_loss_db = overlay.path_loss_db.or(self.path_loss_db);
        self.shadowing_std_db = overlay.shadowing_std_db.or(self.shadowing_std_db);
        self.delay_us = overlay.delay_us.or(self.delay_us);
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefaultsYaml {
    #[serde(default)]
    phy: Mapping,
    #[serde(default)]
    rate: Mapping,
    #[serde(default)]
    link: LinkParamsYaml,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelYaml {
    #[serde(default)]
    simulation: SimulationYaml,
    #[serde(default)]
    defaults: DefaultsYaml,
    #[serde(default)]
    nodes: Vec<NodeYaml>,
    #[serde(default)]
    links: Vec<LinkYaml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeYaml {
    name: String,
    /// When true, the node and its links are removed during merging.
    #[serde(default)]
    remove: bool,
    address: Option<MacAddr>,
    /// PHY overrides, checked once merged.
    #[serde(default)]
    phy: Mapping,
    #[serde(default)]
    rate: Mapping,
    /// Replaces the agent list of an earlier file when present.
    agents: Option<Vec<AgentConfig>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LinkYaml {
    from: String,
    to: String,
    #[serde(default)]
    remove: bool,
    #[serde(default = "default_bidirectional")]
    bidirectional: bool,
    path_loss_db: Option<f64>,
    shadowing_std_db: Option<f64>,
    delay_us: Option<u64>,
}

impl LinkYaml {
    fn params(&self) -> LinkParamsYaml {
        LinkParamsYaml {
            path_loss_db: self.path_loss_db,
            shadowing_std_db: self.shadowing_std_db,
            delay_us: self.delay_us,
        }
    }
}

fn default_bidirectional() -> bool {
    true
}

/// A node's sections accumulated over all files, before defaults apply.
#[derive(Debug, Default)]
struct NodeLayers {
    address: Option<MacAddr>,
    phy: Mapping,
    rate: Mapping,
    agents: Vec<AgentConfig>,
}

/// Deep merge of `overlay` into `base`: nested mappings merge key by key,
/// anything else replaces.
fn merge_mapping(base: &mut Mapping, overlay: &Mapping) {
    for (key, value) in overlay {
        if let (Some(Value::Mapping(existing)), Value::Mapping(nested)) = (base.get_mut(key), value) {
            merge_mapping(existing, nested);
            continue;
        }
        base.insert(key.clone(), value.clone());
    }
}

// ============================================================================
// Model Loading
// ============================================================================

/// Load a scenario from a file.
pub fn load_model(path: &Path) -> Result<Model, ModelError> {
    load_models(&[path])
}

/// Parse a scenario from a YAML string.
pub fn load_model_from_str(yaml_str: &str) -> Result<Model, ModelError> {
    load_models_from_str(&[yaml_str])
}

/// Load and merge several scenario files. See [`load_models_from_str`].
pub fn load_models(paths: &[&Path]) -> Result<Model, ModelError> {
    if paths.is_empty() {
        return Err(ModelError::InvalidConfig("No model files provided".to_string()));
    }
    let yaml_strings = paths
        .iter()
        .map(std::fs::read_to_string)
        .collect::<Result<Vec<String>, std::io::Error>>()?;
    let yaml_strs: Vec<&str> = yaml_strings.iter().map(String::as_str).collect();
    load_models_from_str(&yaml_strs)
}

/// Load and merge several scenarios. Later documents override earlier ones:
/// - `simulation` and `defaults` values are overridden key by key
/// - a node declared again merges its `phy`/`rate` sections into the earlier
///   declaration, and replaces its address and agent list when given
/// - links accumulate; a link declared again overrides the given parameters
/// - `remove: true` deletes a node (with its links) or a link
///
/// References are validated on the merged result only.
pub fn load_models_from_str(yaml_strs: &[&str]) -> Result<Model, ModelError> {
    if yaml_strs.is_empty() {
        return Err(ModelError::InvalidConfig("No model strings provided".to_string()));
    }

    let mut simulation = SimulationConfig::default();
    let mut phy_defaults = Mapping::new();
    let mut rate_defaults = Mapping::new();
    let mut link_defaults = LinkParamsYaml::default();
    let mut nodes: BTreeMap<String, NodeLayers> = BTreeMap::new();
    let mut links: BTreeMap<(String, String), LinkParamsYaml> = BTreeMap::new();

    for yaml_str in yaml_strs {
        let yaml: ModelYaml = serde_yaml::from_str(yaml_str)?;

        simulation.duration_s = yaml.simulation.duration_s.unwrap_or(simulation.duration_s);
        simulation.seed = yaml.simulation.seed.unwrap_or(simulation.seed);
        merge_mapping(&mut phy_defaults, &yaml.defaults.phy);
        merge_mapping(&mut rate_defaults, &yaml.defaults.rate);
        link_defaults.apply(&yaml.defaults.link);

        for node in yaml.nodes {
            if node.remove {
                if nodes.remove(&node.name).is_none() {
                    return Err(ModelError::NodeNotFound(node.name));
                }
                links.retain(|(from, to), _| from != &node.name && to != &node.name);
                continue;
            }
            let layers = nodes.entry(node.name).or_default();
            if node.address.is_some() {
                layers.address = node.address;
            }
            merge_mapping(&mut layers.phy, &node.phy);
            merge_mapping(&mut layers.rate, &node.rate);
            if let Some(agents) = node.agents {
                layers.agents = agents;
            }
        }

        for link in yaml.links {
            let forward = (link.from.clone(), link.to.clone());
            let reverse = (link.to.clone(), link.from.clone());
            if link.remove {
                let existed = links.remove(&forward).is_some();
                if link.bidirectional {
                    links.remove(&reverse);
                }
                if !existed {
                    return Err(ModelError::InvalidLink {
                        from: link.from,
                        to: link.to,
                    });
                }
                continue;
            }
            let params = link.params();
            links.entry(forward).or_default().apply(&params);
            if link.bidirectional {
                links.entry(reverse).or_default().apply(&params);
            }
        }
    }

    if simulation.duration_s <= 0.0 {
        return Err(ModelError::InvalidConfig(format!(
            "simulation duration must be positive, got {}",
            simulation.duration_s
        )));
    }

    let mut resolved_nodes = BTreeMap::new();
    let mut owners: BTreeMap<MacAddr, String> = BTreeMap::new();
    for (ordinal, (name, layers)) in nodes.into_iter().enumerate() {
        let node = resolve_node(name, ordinal, layers, &phy_defaults, &rate_defaults)?;
        if let Some(first) = owners.insert(node.address, node.name.clone()) {
            return Err(ModelError::DuplicateAddress {
                address: node.address,
                first,
                second: node.name,
            });
        }
        resolved_nodes.insert(node.name.clone(), node);
    }

    let mut resolved_links = BTreeMap::new();
    for ((from, to), params) in links {
        if from == to || !resolved_nodes.contains_key(&from) || !resolved_nodes.contains_key(&to) {
            return Err(ModelError::InvalidLink { from, to });
        }
        let link = resolve_link(from, to, &params, &link_defaults)?;
        resolved_links.insert((link.from.clone(), link.to.clone()), link);
    }

    debug!(
        "Loaded model: {} nodes, {} directed links",
        resolved_nodes.len(),
        resolved_links.len()
    );
    Ok(Model {
        simulation,
        nodes: resolved_nodes,
        links: resolved_links,
    })
}

/// Address given to the `ordinal`-th node (0-based) when none is set.
fn auto_address(ordinal: usize) -> MacAddr {
    let n = ordinal + 1;
    MacAddr::new([0x02, 0, 0, 0, (n >> 8) as u8, n as u8])
}

/// Data mode used when no rate section names one: the most robust mode of
/// the node's standard.
fn default_data_mode(phy: &WifiPhyConfig) -> &'static str {
    match phy.standard.max_modulation_class() {
        ModulationClass::Ofdm => "OfdmRate6Mbps",
        ModulationClass::Ht => "HtMcs0",
        ModulationClass::Vht => "VhtMcs0",
        ModulationClass::He => "HeMcs0",
    }
}

fn resolve_node(
    name: String,
    ordinal: usize,
    layers: NodeLayers,
    phy_defaults: &Mapping,
    rate_defaults: &Mapping,
) -> Result<Node, ModelError> {
    let invalid = |message: String| ModelError::InvalidNode {
        node: name.clone(),
        message,
    };

    let mut phy = phy_defaults.clone();
    merge_mapping(&mut phy, &layers.phy);
    let phy: WifiPhyConfig =
        serde_yaml::from_value(Value::Mapping(phy)).map_err(|e| invalid(format!("phy: {e}")))?;

    let mut rate = rate_defaults.clone();
    merge_mapping(&mut rate, &layers.rate);
    if !rate.contains_key("data_mode") {
        rate.insert(Value::from("data_mode"), Value::from(default_data_mode(&phy)));
    }
    let rate: ConstantRateConfig =
        serde_yaml::from_value(Value::Mapping(rate)).map_err(|e| invalid(format!("rate: {e}")))?;
    if ConstantRate::from_config(&rate).is_none() {
        return Err(invalid(format!(
            "unknown mode in rate ({} / {})",
            rate.data_mode, rate.control_mode
        )));
    }

    Ok(Node {
        address: layers.address.unwrap_or_else(|| auto_address(ordinal)),
        phy,
        rate,
        agents: layers.agents,
        name,
    })
}

fn resolve_link(
    from: String,
    to: String,
    params: &LinkParamsYaml,
    defaults: &LinkParamsYaml,
) -> Result<Link, ModelError> {
    let mut merged = defaults.clone();
    merged.apply(params);
    let Some(path_loss_db) = merged.path_loss_db else {
        return Err(ModelError::InvalidConfig(format!(
            "link {from} -> {to} has no path_loss_db and no default"
        )));
    };
    let shadowing_std_db = merged.shadowing_std_db.unwrap_or(0.0);
    if !path_loss_db.is_finite() || shadowing_std_db < 0.0 {
        return Err(ModelError::InvalidConfig(format!(
            "link {from} -> {to}: path loss {path_loss_db} dB, shadowing {shadowing_std_db} dB"
        )));
    }
    Ok(Link {
        from,
        to,
        params: LinkParams {
            path_loss_db,
            shadowing_std_db,
            delay: SimTime::from_micros(merged.delay_us.unwrap_or(0)),
        },
    })
}

// ============================================================================
// Simulation Building
// ============================================================================

/// Entities of one node, for display and trace labelling.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub address: MacAddr,
    pub is_ap: bool,
    pub phy_entity_id: EntityId,
    /// Agent entity ids with their kind.
    pub agents: Vec<(EntityId, &'static str)>,
}

/// Result of building a simulation from a model.
pub struct BuiltSimulation {
    pub entities: EntityRegistry,
    /// Agent start and stop timers.
    pub initial_events: Vec<Event>,
    pub node_infos: Vec<NodeInfo>,
    pub duration: SimTime,
    pub seed: u64,
}

/// Build the medium, PHYs and agents of a model.
///
/// Entity ids: the medium is 0, PHYs follow in node name order, then each
/// node's agents in declaration order.
pub fn build_simulation(model: &Model) -> Result<BuiltSimulation, ModelError> {
    let mut entities = EntityRegistry::new();
    let mut initial_events = Vec::new();
    let mut event_id_counter: u64 = 0;
    let mut next_entity_id = MEDIUM_ENTITY.0 + 1;

    let mut phy_ids: BTreeMap<&str, EntityId> = BTreeMap::new();
    for name in model.nodes().keys() {
        phy_ids.insert(name, EntityId(next_entity_id));
        next_entity_id += 1;
    }

    let mut node_infos = Vec::with_capacity(model.nodes().len());
    for node in model.nodes().values() {
        let phy_id = *phy_ids
            .get(node.name.as_str())
            .ok_or_else(|| ModelError::NodeNotFound(node.name.clone()))?;
        let agent_ids: Vec<EntityId> = node
            .agents
            .iter()
            .map(|_| {
                let id = EntityId(next_entity_id);
                next_entity_id += 1;
                id
            })
            .collect();

        let role = if node.phy.is_ap { "ap" } else { "sta" };
        let mut phy = WifiPhy::new(
            phy_id,
            node.phy.clone(),
            MEDIUM_ENTITY,
            MetricLabels::new(node.name.clone(), role),
        )
        .map_err(|source| ModelError::Phy {
            node: node.name.clone(),
            source,
        })?;
        for agent_id in &agent_ids {
            phy.add_listener(*agent_id);
        }
        debug!("Node '{}': {} on {}, address {}", node.name, role, phy.channel(), node.address);
        entities.register(Box::new(phy));

        let attached = AttachedPhy {
            node: node.name.clone(),
            phy: phy_id,
            address: node.address,
            sta_id: node.phy.sta_id,
            bss_color: node.phy.bss_color,
            band: node.phy.band,
        };
        let mut agents = Vec::with_capacity(node.agents.len());
        for (agent_id, config) in agent_ids.iter().zip(&node.agents) {
            let rate = ConstantRate::from_config(&node.rate).ok_or_else(|| ModelError::InvalidNode {
                node: node.name.clone(),
                message: format!("unknown data mode {}", node.rate.data_mode),
            })?;
            let built = create_agent(*agent_id, attached.clone(), config, Box::new(rate))?;
            for (time, timer_id) in built.timers {
                initial_events.push(Event {
                    id: EventId(event_id_counter),
                    time,
                    source: *agent_id,
                    targets: vec![*agent_id],
                    payload: EventPayload::Timer { timer_id },
                });
                event_id_counter += 1;
            }
            entities.register(built.entity);
            agents.push((*agent_id, config.kind()));
        }

        node_infos.push(NodeInfo {
            name: node.name.clone(),
            address: node.address,
            is_ap: node.phy.is_ap,
            phy_entity_id: phy_id,
            agents,
        });
    }

    let mut link_model = LinkModel::new();
    for link in model.links().values() {
        let from = phy_ids
            .get(link.from.as_str())
            .ok_or_else(|| ModelError::NodeNotFound(link.from.clone()))?;
        let to = phy_ids
            .get(link.to.as_str())
            .ok_or_else(|| ModelError::NodeNotFound(link.to.clone()))?;
        link_model.add_link(*from, *to, link.params);
    }
    entities.register(Box::new(Medium::new(MEDIUM_ENTITY, link_model)));

    info!(
        "Built simulation: {} nodes, {} entities, {} initial events",
        node_infos.len(),
        entities.len(),
        initial_events.len()
    );
    Ok(BuiltSimulation {
        entities,
        initial_events,
        node_infos,
        duration: model.simulation().duration(),
        seed: model.simulation().seed,
    })
}

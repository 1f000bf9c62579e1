use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use grove::config::GroveConfig;
use grove::store::{
    render, CategoryPatch, GroveStorage, NewEdge, NewNode, NewTree, NodeId, NodePatch,
    Properties, PropertyKey, SubtreeQuery, TreeId,
};
use serde::Serialize;
use std::path::PathBuf;

/// Grove - nested-set trees in SQLite
#[derive(Parser, Debug)]
#[command(name = "grove", version)]
#[command(about = "Grove - hierarchical trees stored as nested-set intervals")]
struct Cli {
    /// TOML configuration file (ignored if missing)
    #[arg(long, default_value = "grove.toml")]
    config: PathBuf,

    /// Database path, overriding configuration and GROVE_DB_PATH
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage trees
    #[command(subcommand)]
    Tree(TreeCommand),

    /// Manage nodes of a tree
    #[command(subcommand)]
    Node(NodeCommand),

    /// Report nested-set invariant violations of a tree
    Check { tree: TreeId },

    /// Rebuild a tree's intervals from its parent links
    Renumber { tree: TreeId },

    /// Print JSON schemas of the input types
    Schema,
}

#[derive(Subcommand, Debug)]
enum TreeCommand {
    Create {
        name: String,
        #[arg(long)]
        props: Option<String>,
    },
    List,
    /// Draw a tree, or the subtree below --node
    Show {
        tree: TreeId,
        #[arg(long)]
        node: Option<NodeId>,
        #[arg(long)]
        depth: Option<u32>,
    },
    Delete { tree: TreeId },
}

#[derive(Subcommand, Debug)]
enum NodeCommand {
    Add(AddNode),
    /// Move a node and its subtree; omit --to to make it a root
    Move {
        tree: TreeId,
        node: NodeId,
        #[arg(long)]
        to: Option<NodeId>,
    },
    /// Delete a node and all of its descendants
    Rm { tree: TreeId, node: NodeId },
    Update(UpdateNode),
    /// Ancestors of a node, root first
    Path { tree: TreeId, node: NodeId },
    Subtree {
        tree: TreeId,
        node: NodeId,
        #[arg(long)]
        depth: Option<u32>,
    },
    /// Increment a named counter
    Bump {
        tree: TreeId,
        node: NodeId,
        counter: PropertyKey,
        #[arg(long, default_value = "1", allow_hyphen_values = true)]
        by: i64,
    },
    /// Link two nodes
    Link {
        tree: TreeId,
        source: NodeId,
        target: NodeId,
        #[arg(long, default_value = "related")]
        kind: String,
    },
}

#[derive(Args, Debug)]
struct AddNode {
    tree: TreeId,
    name: String,
    #[arg(long)]
    parent: Option<NodeId>,
    #[arg(long)]
    position: Option<i64>,
    /// Properties as a JSON object
    #[arg(long)]
    props: Option<String>,
}

#[derive(Args, Debug)]
struct UpdateNode {
    tree: TreeId,
    node: NodeId,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    position: Option<i64>,
    /// Replacement properties as a JSON object
    #[arg(long)]
    props: Option<String>,
}

fn parse_properties(raw: Option<&str>) -> anyhow::Result<Option<Properties>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: serde_json::Value = serde_json::from_str(raw).context("--props is not valid JSON")?;
    Ok(Some(Properties::try_from(value)?))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn subtree_query(depth: Option<u32>) -> SubtreeQuery {
    depth.map_or_else(SubtreeQuery::unbounded, SubtreeQuery::max_depth)
}

async fn run_tree(storage: &GroveStorage, command: TreeCommand) -> anyhow::Result<()> {
    match command {
        TreeCommand::Create { name, props } => {
            let properties = parse_properties(props.as_deref())?.unwrap_or_default();
            let tree = storage.create_tree(NewTree { name, properties }).await?;
            tracing::info!(tree = %tree.id, "Created tree");
            print_json(&tree)
        }
        TreeCommand::List => print_json(&storage.list_trees().await?),
        TreeCommand::Show { tree, node, depth } => {
            let nodes = match node {
                Some(node) => storage
                    .get_subtree(&tree, &node, subtree_query(depth))
                    .await?
                    .into_iter()
                    .map(|entry| entry.node)
                    .collect(),
                None => {
                    let all = storage.list_all_nodes(&tree).await?;
                    match depth {
                        Some(max) => all.into_iter().filter(|n| n.depth <= i64::from(max)).collect(),
                        None => all,
                    }
                }
            };
            print!("{}", render(&nodes));
            Ok(())
        }
        TreeCommand::Delete { tree } => {
            if !storage.delete_tree(&tree).await? {
                anyhow::bail!("Tree not found: {}", tree);
            }
            tracing::info!(tree = %tree, "Deleted tree");
            Ok(())
        }
    }
}

async fn run_node(storage: &GroveStorage, command: NodeCommand) -> anyhow::Result<()> {
    match command {
        NodeCommand::Add(add) => {
            let mut input = NewNode::new(add.name);
            input.parent_id = add.parent;
            input.position = add.position;
            input.properties = parse_properties(add.props.as_deref())?.unwrap_or_default();
            print_json(&storage.create_node(&add.tree, input).await?)
        }
        NodeCommand::Move { tree, node, to } => {
            let moved = storage
                .move_subtree(&tree, &node, to.as_ref())
                .await?
                .with_context(|| format!("Node not found: {}", node))?;
            print_json(&moved)
        }
        NodeCommand::Rm { tree, node } => {
            let removed = storage
                .delete_subtree(&tree, &node)
                .await?
                .with_context(|| format!("Node not found: {}", node))?;
            tracing::info!(tree = %tree, node = %node, removed, "Deleted subtree");
            Ok(())
        }
        NodeCommand::Update(update) => {
            let patch = NodePatch {
                name: update.name,
                position: update.position,
                properties: parse_properties(update.props.as_deref())?,
                category_id: None,
            };
            let node = storage
                .update_node(&update.tree, &update.node, patch)
                .await?
                .with_context(|| format!("Node not found: {}", update.node))?;
            print_json(&node)
        }
        NodeCommand::Path { tree, node } => {
            print_json(&storage.get_path_to_root(&tree, &node).await?)
        }
        NodeCommand::Subtree { tree, node, depth } => {
            print_json(&storage.get_subtree(&tree, &node, subtree_query(depth)).await?)
        }
        NodeCommand::Bump {
            tree,
            node,
            counter,
            by,
        } => {
            let updated = storage
                .increment_counter(&tree, &node, &counter, by)
                .await?
                .with_context(|| format!("Node not found: {}", node))?;
            print_json(&updated.properties.counter(counter.as_str()))
        }
        NodeCommand::Link {
            tree,
            source,
            target,
            kind,
        } => {
            let edge = storage
                .create_edge(
                    &tree,
                    NewEdge {
                        source_id: source,
                        target_id: target,
                        edge_type: kind,
                        properties: Properties::new(),
                    },
                )
                .await?;
            print_json(&edge)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (silently ignore if not found)
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("grove=info,sqlx=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Command::Schema = cli.command {
        let schemas = serde_json::json!({
            "NewTree": schemars::schema_for!(NewTree),
            "NewNode": schemars::schema_for!(NewNode),
            "NodePatch": schemars::schema_for!(NodePatch),
            "NewEdge": schemars::schema_for!(NewEdge),
            "CategoryPatch": schemars::schema_for!(CategoryPatch),
            "SubtreeQuery": schemars::schema_for!(SubtreeQuery),
        });
        return print_json(&schemas);
    }

    let mut config = GroveConfig::load(Some(&cli.config))?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    tracing::debug!(db = %config.db_path.display(), "Opening database");
    let storage = GroveStorage::new(config).await?;

    match cli.command {
        Command::Tree(command) => run_tree(&storage, command).await,
        Command::Node(command) => run_node(&storage, command).await,
        Command::Check { tree } => {
            let violations = storage.verify_tree(&tree).await?;
            if violations.is_empty() {
                tracing::info!(tree = %tree, "Tree is consistent");
                return Ok(());
            }
            print_json(&violations)?;
            anyhow::bail!("{} invariant violation(s) in tree {}", violations.len(), tree)
        }
        Command::Renumber { tree } => {
            let count = storage
                .renumber_tree(&tree)
                .await?
                .with_context(|| format!("Tree not found: {}", tree))?;
            tracing::info!(tree = %tree, nodes = count, "Renumbered tree");
            Ok(())
        }
        Command::Schema => Ok(()),
    }
}

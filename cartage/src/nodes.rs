//! Thin wrappers over the queue's node administration RPCs.

use clap::Args;
use tokio_postgres::Client;

use cartage_core::Config;
use cartage_queue::copydata::connect_database;
use cartage_queue::NodeInfo;

#[derive(Args, Debug, Clone)]
pub struct CreateOpts {
    /// Name for the local node
    pub node_name: String,

    /// Public connect string other nodes use to reach this one
    pub node_location: String,

    /// Connect string of the provider node (branch/leaf)
    #[arg(long)]
    pub provider: Option<String>,
}

async fn db(cf: &Config) -> anyhow::Result<Client> {
    Ok(connect_database(&cf.db).await?)
}

pub async fn create_node(cf: Config, node_type: &str, opts: CreateOpts) -> anyhow::Result<i32> {
    let db = db(&cf).await?;
    let worker = cf.job_name.clone();

    db.execute(
        "select * from pgq_node.register_location($1, $2, $3, false)",
        &[&cf.queue_name, &opts.node_name, &opts.node_location],
    )
    .await?;

    let provider_name = match &opts.provider {
        Some(provider_loc) => {
            // read the provider's node name and register it locally
            let pdb = connect_database(provider_loc).await?;
            let pinfo = NodeInfo::load(&pdb, &cf.queue_name).await?;
            db.execute(
                "select * from pgq_node.register_location($1, $2, $3, false)",
                &[&cf.queue_name, &pinfo.node_name, provider_loc],
            )
            .await?;
            Some(pinfo.node_name)
        }
        None => None,
    };

    db.execute(
        "select * from pgq_node.create_node($1, $2, $3, $4, $5, null, null)",
        &[
            &cf.queue_name,
            &node_type.to_owned(),
            &opts.node_name,
            &worker,
            &provider_name,
        ],
    )
    .await?;
    println!("node {} created as {}", opts.node_name, node_type);
    Ok(0)
}

pub async fn status(cf: Config) -> anyhow::Result<i32> {
    let db = db(&cf).await?;
    let node = NodeInfo::load(&db, &cf.queue_name).await?;

    println!("node: {}", node.node_name);
    println!("type: {:?}", node.node_type);
    if let Some(provider) = &node.provider_node {
        println!("provider: {provider}");
    }
    if let Some(worker) = &node.worker_name {
        println!("worker: {worker}");
    }

    // per-table summary, same shape the workers log
    let rows = db
        .query(
            "select local, merge_state from cartage.get_table_list($1)",
            &[&cf.queue_name],
        )
        .await?;
    let mut n_ok = 0;
    let mut n_half = 0;
    let mut n_ign = 0;
    for row in rows {
        let local: bool = row.try_get("local")?;
        let state: Option<String> = row.try_get("merge_state")?;
        if !local {
            n_ign += 1;
        } else if state.as_deref() == Some("ok") {
            n_ok += 1;
        } else {
            n_half += 1;
        }
    }
    println!("tables: {n_ok}/{n_half}/{n_ign} (ok/copying/ignored)");
    Ok(0)
}

pub async fn members(cf: Config) -> anyhow::Result<i32> {
    let db = db(&cf).await?;
    let rows = db
        .query(
            "select node_name, node_location, dead from pgq_node.get_queue_locations($1)",
            &[&cf.queue_name],
        )
        .await?;
    for row in rows {
        let name: String = row.try_get("node_name")?;
        let loc: String = row.try_get("node_location")?;
        let dead: bool = row.try_get("dead")?;
        println!("{name}\t{}\t{loc}", if dead { "dead" } else { "alive" });
    }
    Ok(0)
}

pub async fn set_paused(cf: Config, paused: bool) -> anyhow::Result<i32> {
    let db = db(&cf).await?;
    let node = NodeInfo::load(&db, &cf.queue_name).await?;
    let worker = node.worker_name.unwrap_or_else(|| cf.job_name.clone());
    db.execute(
        "select * from pgq_node.set_consumer_paused($1, $2, $3)",
        &[&cf.queue_name, &worker, &paused],
    )
    .await?;
    println!("worker {worker} {}", if paused { "paused" } else { "resumed" });
    Ok(0)
}

pub async fn drop_node(cf: Config, node: &str) -> anyhow::Result<i32> {
    let db = db(&cf).await?;
    db.execute(
        "select * from pgq_node.drop_node($1, $2)",
        &[&cf.queue_name, &node.to_owned()],
    )
    .await?;
    println!("node {node} dropped");
    Ok(0)
}

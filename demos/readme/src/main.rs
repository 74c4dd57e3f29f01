use std::time::Duration;

use anyhow::Result;
use tokio::time::sleep;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use trellis::node::{prop, Blueprint};
use trellis::rule::annotations::{range, required};
use trellis::rule::{act_async, RunFlags};

// An order line: entities are declared through blueprints, which register
// properties and rules once and are shared by every instance
fn line() -> Blueprint {
    Blueprint::entity("Line")
        .property(prop("sku").display("Article"))
        .property(prop("qty").default_value(1).display("Quantity"))
        .property(prop("total").default_value(0))
        .rule(required("sku"))
        .rule(range("qty", 1.0, 99.0))
        // an asynchronous side-effect rule: recompute the line total when
        // the quantity changes. The assignment through `ctx.set` cascades
        // like any other property change.
        .rule(act_async(["qty"], |ctx| async move {
            // stand-in for a price lookup against a remote service
            sleep(Duration::from_millis(10)).await;
            let qty: i64 = ctx.get_as("qty")?;
            ctx.set("total", qty * 250)?;
            Ok(())
        }))
}

fn order() -> Blueprint {
    Blueprint::entity("Order")
        .property(prop("number").display("Order number"))
        .rule(required("number"))
        .list("lines", line())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().event_format(fmt::format().compact().with_target(false)))
        .init();

    // a brand-new order: rules run immediately, so the empty order is
    // invalid until its required properties are filled in
    let order = order().create();
    order.wait_for_tasks().await?;
    println!("fresh order valid? {}", order.is_valid());
    for message in order.messages() {
        println!("  {}: {}", message.path, message.text);
    }

    order.set("number", "ORD-1001")?;

    let first = line().create();
    first.wait_for_tasks().await?;
    first.set("sku", "TRL-PLANTER")?;
    first.set("qty", 3)?;
    first.wait_for_tasks().await?;
    order.list("lines")?.add(first.clone())?;

    // the quantity rule cascaded into the line total, and the line's
    // validity rolled up into the order
    order.wait_for_tasks().await?;
    println!(
        "line total: {}, order valid? {}, savable? {}",
        first.get_as::<i64>("total")?,
        order.is_valid(),
        order.is_savable()
    );

    // the whole graph round-trips through plain serde data with messages,
    // modification flags and rule identity intact
    let snapshot = order.snapshot();
    let wire = serde_json::to_string_pretty(&snapshot)?;
    let restored = self::order().restore(&serde_json::from_str(&wire)?)?;
    restored.run_rules(RunFlags::ALL).await?;
    println!("restored order valid? {}", restored.is_valid());

    Ok(())
}

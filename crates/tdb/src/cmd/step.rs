// TDB - Trace Debugger
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Step command - inspect the machine and variables at one step

use alloy_primitives::TxHash;
use eyre::{eyre, Result};
use serde_json::json;
use tdb_engine::Debugger;

use crate::{session, Cli};

/// Print the opcode, source line, stack, locals and state variables at `step`.
pub async fn show_step(debugger: &Debugger, tx: TxHash, step: usize, cli: &Cli) -> Result<()> {
    session::load(debugger, tx).await?;
    let trace = debugger.trace().ok_or_else(|| eyre!("trace of {tx} is not loaded"))?;
    let current = trace.step(step)?;
    debugger.jump_to(step);

    let location = debugger.source_location_at(step);
    let locals = debugger.decode_locals_at(step).await;
    let state = debugger.decode_state_at(step).await;

    if cli.json {
        let out = json!({
            "step": step,
            "op": current.op_name,
            "pc": current.pc,
            "depth": current.depth,
            "gas": current.gas,
            "address": trace.address_at(step)?,
            "source": location,
            "stack": current.stack,
            "locals": locals,
            "state": state,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!(
        "step {step}: {} at pc {} (depth {}, gas {})",
        current.op_name, current.pc, current.depth, current.gas
    );
    println!("address: {}", trace.address_at(step)?);
    if let Some(location) = location {
        println!("source:  {}:{}", location.file, location.line);
    }

    println!("stack:");
    for (i, word) in current.stack.iter().rev().enumerate() {
        println!("  {i:>3}: {word:#066x}");
    }
    println!("locals:");
    for variable in &locals {
        println!("  {} {} = {}", variable.decoded.ty(), variable.name, variable.decoded);
    }
    println!("state:");
    for variable in &state {
        println!("  {} {} = {}", variable.decoded.ty(), variable.name, variable.decoded);
    }
    Ok(())
}

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

//! Calls command - print the call tree of a transaction

use alloy_primitives::TxHash;
use eyre::{eyre, Result};
use tdb_engine::Debugger;

use crate::{session, Cli};

/// Print every message call of `tx`, nested by depth, with reverted frames marked.
pub async fn show_calls(debugger: &Debugger, tx: TxHash, cli: &Cli) -> Result<()> {
    // The call tree does not need the scope build, but loading starts it anyway.
    session::load(debugger, tx).await?;
    let trace = debugger.trace().ok_or_else(|| eyre!("trace of {tx} is not loaded"))?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(trace.frames())?);
        return Ok(());
    }

    println!("{} steps, {} gas used{}", trace.len(), trace.gas_used(), failed_mark(trace.failed()));
    print!("{}", trace.format_call_tree());
    Ok(())
}

fn failed_mark(failed: bool) -> &'static str {
    if failed {
        ", failed"
    } else {
        ""
    }
}

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

//! Scopes command - print the scope tree and gas per source line

use alloy_primitives::TxHash;
use eyre::{eyre, Result};
use serde_json::json;
use tdb_engine::{BuildOutcome, Debugger};

use crate::{session, Cli};

/// Print the scope tree of `tx` followed by the gas spent on each source line.
pub async fn show_scopes(debugger: &Debugger, tx: TxHash, cli: &Cli) -> Result<()> {
    let tree = match session::load(debugger, tx).await? {
        Some(BuildOutcome::Ready(tree)) => tree,
        Some(BuildOutcome::BuildFailed(reason)) => {
            return Err(eyre!("scope tree build failed: {reason}"))
        }
        Some(BuildOutcome::NoCompilationData) => {
            return Err(eyre!("no compilation data for {tx}, pass --solc-input/--solc-output"))
        }
        None => return Err(eyre!("scope tree of {tx} is not available")),
    };
    let gas = debugger.gas_per_line().unwrap_or_default();

    if cli.json {
        let out = json!({ "scopes": tree.scopes(), "gasPerLine": gas });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    print!("{}", tree.format_tree());
    println!();
    for (file, lines) in &gas {
        println!("{file}");
        for (line, cost) in lines {
            println!("  {line:>5}  {cost:>10}");
        }
    }
    Ok(())
}

use kernelmux_wire::{msg_id, Channel};
use serde::Serialize;

use crate::cmd::DecodeArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_record, OutputFormat};

#[derive(Serialize)]
struct DecodeOutput {
    id: String,
    encoded: bool,
    channel: Option<Channel>,
    base_id: String,
    cell_id: Option<String>,
    stripped: String,
}

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let routing = msg_id::decode(&args.id);
    let out = DecodeOutput {
        encoded: msg_id::is_encoded(&args.id),
        channel: routing.channel,
        cell_id: routing.cell_id,
        stripped: msg_id::strip(&args.id).to_string(),
        base_id: routing.base_id,
        id: args.id,
    };
    print_record(&out, format);
    Ok(SUCCESS)
}

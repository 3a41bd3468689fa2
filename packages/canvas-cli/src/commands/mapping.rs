use crate::cli::MappingArgs;
use crate::exit_codes;
use crate::output;
use canvas_rs::mapping::generate_channel_mapping;
use std::path::Path;

pub fn execute(args: MappingArgs) -> i32 {
    let mapping = generate_channel_mapping(args.start, args.channels);
    match output::write_output(&mapping, args.output.as_deref().map(Path::new)) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit_codes::EXECUTION_ERROR
        }
    }
}

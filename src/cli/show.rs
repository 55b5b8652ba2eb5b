use std::path::PathBuf;

use tilesched::ir::samples;

use super::load_kernel;

pub fn cmd_show(input: Option<PathBuf>, builtin: Option<String>, list: bool) {
    if list {
        for name in samples::BUILTINS {
            println!("{}", name);
        }
        return;
    }
    let loaded = load_kernel(input.as_deref(), builtin.as_deref());
    print!("{}", loaded.kernel.trace);
    let constraints = &loaded.kernel.constraints;
    for t in &constraints.tiling {
        println!("tile {} by {} -> {} trips", t.dim, t.tile_size, t.count());
    }
    for a in &constraints.assumptions {
        println!("assume {}", a);
    }
    for (name, value) in &constraints.hyperparams {
        println!("set {} = {}", name, value);
    }
}

pub mod chnk;
pub mod gltf;
pub mod mdpc;

use argh::FromArgs;

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
pub enum SubCommand {
    Chnk(chnk::Args),
    Mdpc(mdpc::Args),
}

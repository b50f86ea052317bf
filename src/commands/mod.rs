use std::io::{self, Write};

use anyhow::Result;
use clap::{Args, Subcommand};
use tracing as log;

use crate::{AppCtx, changer::Changer, notify::Bconsole, session};

mod drive;
mod listing;
mod volumes;

use drive::DriveArgs;
use volumes::CreateVolsArgs;

/// Autochanger commands, in the argument order Bacula's changer script uses:
/// `<command> [slot] [device] [drive]`.
#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Print `slot:label` for every virtual slot.
    #[command(alias = "LIST")]
    List(ListArgs),
    /// Print the number of virtual slots.
    #[command(alias = "SLOTS")]
    Slots(ListArgs),
    /// Load the volume in <slot> into <drive>.
    #[command(alias = "LOAD")]
    Load(DriveArgs),
    /// Unload <drive>.
    #[command(alias = "UNLOAD")]
    Unload(DriveArgs),
    /// Print the slot loaded in <drive>, or 0.
    #[command(alias = "LOADED")]
    Loaded(DriveArgs),
    /// Print drive and slot status.
    #[command(alias = "LISTALL")]
    Listall(ListArgs),
    /// Print magazine status.
    #[command(alias = "LISTMAGS")]
    Listmags(ListArgs),
    /// Create empty volume files on a magazine.
    #[command(alias = "CREATEVOLS")]
    Createvols(CreateVolsArgs),
    /// Only run the console notification step.
    #[command(alias = "REFRESH")]
    Refresh(RefreshArgs),
}

/// Trailing arguments are accepted and ignored.
#[derive(Args, Debug, Default)]
pub struct ListArgs {
    #[arg(hide = true, num_args = 0.., trailing_var_arg = true, allow_hyphen_values = true)]
    pub rest: Vec<String>,
}

#[derive(Args, Debug, Default)]
pub struct RefreshArgs {
    /// Issue 'update slots' even when nothing changed.
    #[arg(long)]
    pub force: bool,

    #[arg(hide = true, num_args = 0.., trailing_var_arg = true, allow_hyphen_values = true)]
    pub rest: Vec<String>,
}

impl Cmd {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        let pool = match self {
            Cmd::Createvols(a) => a.pool.as_deref(),
            _ => None,
        }
        .unwrap_or(ctx.cfg.changer.default_pool.as_str());
        let force = matches!(self, Cmd::Refresh(a) if a.force);
        let notifier = Bconsole::from_config(&ctx.cfg, pool);

        session::execute(&ctx.cfg, &notifier, force, |changer| {
            let mut out = io::stdout().lock();
            self.execute(changer, &mut out)?;
            out.flush()?;
            Ok(())
        })
    }

    /// Runs the command against an initialized changer, writing protocol
    /// output to `out`.
    pub fn execute(&self, changer: &mut Changer, out: &mut dyn Write) -> Result<()> {
        log::debug!("[command] {}", self.name());
        match self {
            Cmd::List(_) => listing::list(changer, out),
            Cmd::Slots(_) => listing::slots(changer, out),
            Cmd::Load(a) => a.load(changer),
            Cmd::Unload(a) => a.unload(changer),
            Cmd::Loaded(a) => a.loaded(changer, out),
            Cmd::Listall(_) => listing::listall(changer, out),
            Cmd::Listmags(_) => listing::listmags(changer, out),
            Cmd::Createvols(a) => a.run(changer, out),
            Cmd::Refresh(_) => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Cmd::List(_) => "list",
            Cmd::Slots(_) => "slots",
            Cmd::Load(_) => "load",
            Cmd::Unload(_) => "unload",
            Cmd::Loaded(_) => "loaded",
            Cmd::Listall(_) => "listall",
            Cmd::Listmags(_) => "listmags",
            Cmd::Createvols(_) => "createvols",
            Cmd::Refresh(_) => "refresh",
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(subcommand)]
        cmd: Cmd,
    }

    fn parse(args: &[&str]) -> Cmd {
        let mut argv = vec!["vchanger"];
        argv.extend_from_slice(args);
        TestCli::try_parse_from(argv).unwrap().cmd
    }

    #[test]
    fn bacula_argument_order() {
        match parse(&["load", "3", "/var/spool/vchanger/vc/0", "0"]) {
            Cmd::Load(a) => {
                assert_eq!((a.slot, a.drive), (3, 0));
                assert_eq!(a.device, "/var/spool/vchanger/vc/0");
            }
            other => panic!("parsed {other:?}"),
        }
    }

    #[test]
    fn upper_case_aliases_and_trailing_args() {
        assert!(matches!(parse(&["LIST", "0", "/dev/null", "0"]), Cmd::List(_)));
        assert!(matches!(parse(&["SLOTS"]), Cmd::Slots(_)));
        assert!(matches!(parse(&["LOADED", "0", "/dev/null", "1"]), Cmd::Loaded(_)));
        assert!(matches!(parse(&["listall", "x", "y"]), Cmd::Listall(_)));
        assert!(matches!(parse(&["refresh", "--force"]), Cmd::Refresh(RefreshArgs { force: true, .. })));
    }

    #[test]
    fn createvols_options() {
        match parse(&["createvols", "1", "4", "-l", "tape_", "--pool", "Offsite"]) {
            Cmd::Createvols(a) => {
                assert_eq!((a.bay, a.count, a.start), (1, 4, None));
                assert_eq!(a.label.as_deref(), Some("tape_"));
                assert_eq!(a.pool.as_deref(), Some("Offsite"));
            }
            other => panic!("parsed {other:?}"),
        }
        match parse(&["createvols", "0", "2", "7"]) {
            Cmd::Createvols(a) => assert_eq!(a.start, Some(7)),
            other => panic!("parsed {other:?}"),
        }
    }

    #[test]
    fn drive_commands_need_all_positionals() {
        let argv = ["vchanger", "load", "1", "/dev/null"];
        assert!(TestCli::try_parse_from(argv).is_err());
    }
}

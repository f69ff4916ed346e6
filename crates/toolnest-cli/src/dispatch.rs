use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use dialoguer::Confirm;
use toolnest_core::{validate_package_name, Action, Catalog, UNKNOWN_VERSION};
use toolnest_installer::{
    dir_is_populated, write_env_file, CancelToken, HandlerRegistry, SegmentedDownloader,
    SilentNativeInstaller, ToolLayout, VersionStore,
};
use toolnest_resolver::{reconcile, version_satisfies_pin, FsToolDirectory, Reconciliation};

use crate::completion::write_completions_script;
use crate::config::{CliOverrides, Config};
use crate::metadata::fetch_catalog;
use crate::render::{
    render_action_lines, render_list_lines, render_plan_lines, render_session_summary_lines,
    SessionView, TerminalRenderer,
};
use crate::session::Session;
use crate::{Cli, Commands};

/// Long-lived state for one invocation.
pub(crate) struct Workspace {
    pub(crate) config: Config,
    pub(crate) layout: ToolLayout,
    pub(crate) store: VersionStore,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) downloader: SegmentedDownloader,
}

impl Workspace {
    pub(crate) fn open(config: Config, cancel: CancelToken) -> Result<Self> {
        let layout = config.layout();
        layout.ensure_base_dirs()?;
        let store = VersionStore::load(layout.store_path())?;

        let mut handlers = HandlerRegistry::new(Arc::new(SilentNativeInstaller));
        for (name, family) in &config.families {
            handlers.register_family(name.clone(), *family);
        }
        let downloader =
            SegmentedDownloader::new(config.download.clone())?.with_cancel_token(cancel);

        Ok(Self {
            config,
            layout,
            store,
            handlers,
            downloader,
        })
    }

    pub(crate) fn fetch_catalog(&self) -> Result<Catalog> {
        fetch_catalog(
            self.config.require_catalog_url()?,
            self.config.download.connect_timeout,
        )
    }

    pub(crate) fn reconcile(&mut self, catalog: &Catalog) -> Result<Reconciliation> {
        let tools = FsToolDirectory::new(self.layout.tools_dir());
        reconcile(catalog, &mut self.store, &tools)
    }

    /// Runs `actions` and fails when any of them did not complete.
    pub(crate) fn apply(
        &mut self,
        catalog: &Catalog,
        actions: &[Action],
        force_download: bool,
        renderer: TerminalRenderer,
    ) -> Result<()> {
        let view = SessionView::new(renderer);
        let report = Session::new(
            &self.layout,
            catalog,
            &self.handlers,
            &self.downloader,
            self.config.retry.clone(),
        )
        .force_download(force_download)
        .apply(&mut self.store, actions, &view);

        renderer.print_section("Session Summary");
        renderer.print_lines(&render_session_summary_lines(&report));
        if let Some(path) = &report.env_file {
            renderer.print_status("ok", &format!("environment file: {}", path.display()));
        }

        if report.is_success() {
            return Ok(());
        }
        Err(anyhow!(
            "{} of {} action(s) did not complete",
            report.failed.len(),
            actions.len()
        ))
    }
}

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    let command = cli.command.unwrap_or(Commands::Interactive);
    if let Commands::Completions { shell } = command {
        return write_completions_script(shell, &mut std::io::stdout().lock());
    }

    let config = Config::load(&CliOverrides {
        root: cli.root,
        catalog_url: cli.catalog_url,
    })?;
    let cancel = CancelToken::new();
    install_interrupt_handler(&cancel);
    let mut workspace = Workspace::open(config, cancel)?;
    let renderer = TerminalRenderer::current();

    match command {
        Commands::Interactive => {
            if !std::io::stdin().is_terminal() {
                bail!("interactive mode needs a terminal; use `toolnest sync --yes` instead");
            }
            let catalog = workspace.fetch_catalog()?;
            let plan = workspace.reconcile(&catalog)?;
            print_plan(renderer, &catalog, &plan);
            if plan.is_up_to_date() {
                renderer.print_status("ok", "All SDKs are up to date");
                return Ok(());
            }
            if !confirm("Proceed with these actions?")? {
                renderer.print_status("warn", "no changes applied");
                return Ok(());
            }
            workspace.apply(&catalog, &plan.actions, false, renderer)?;
        }
        Commands::Sync { yes, dry_run } => {
            let catalog = workspace.fetch_catalog()?;
            let plan = workspace.reconcile(&catalog)?;
            print_plan(renderer, &catalog, &plan);
            if plan.is_up_to_date() {
                renderer.print_status("ok", "All SDKs are up to date");
                return Ok(());
            }
            if dry_run {
                return Ok(());
            }
            if !yes && std::io::stdin().is_terminal() && !confirm("Proceed with these actions?")? {
                renderer.print_status("warn", "no changes applied");
                return Ok(());
            }
            workspace.apply(&catalog, &plan.actions, false, renderer)?;
        }
        Commands::Install {
            name,
            version_pin,
            force,
        } => {
            let catalog = workspace.fetch_catalog()?;
            let descriptor = catalog
                .get(&name)
                .ok_or_else(|| anyhow!("package '{name}' is not in the catalog"))?;
            if let Some(pin) = &version_pin {
                if !version_satisfies_pin(&descriptor.version, pin) {
                    bail!(
                        "catalog offers {name} v{}, which does not satisfy --version {pin}",
                        descriptor.version
                    );
                }
            }

            let plan = workspace.reconcile(&catalog)?;
            report_reconcile_notes(renderer, &plan);
            let action = match plan.action_for(&name) {
                Some(action) => action.clone(),
                None if force => Action::Install {
                    name: name.clone(),
                    version: descriptor.version.clone(),
                },
                None => {
                    renderer.print_status(
                        "ok",
                        &format!("{name} v{} is already installed", descriptor.version),
                    );
                    return Ok(());
                }
            };
            workspace.apply(&catalog, &[action], force, renderer)?;
        }
        Commands::Update {
            name,
            version_pin,
            check,
        } => {
            let catalog = workspace.fetch_catalog()?;
            let plan = workspace.reconcile(&catalog)?;
            report_reconcile_notes(renderer, &plan);
            if let Some(name) = &name {
                if plan.local_version(name).is_none() {
                    bail!("package '{name}' is not installed");
                }
            }

            let upgrades = plan
                .actions
                .iter()
                .filter(|action| matches!(action, Action::Upgrade { .. }))
                .filter(|action| name.as_deref().is_none_or(|name| action.name() == name))
                .cloned()
                .collect::<Vec<_>>();
            if let (Some(pin), Some(action)) = (&version_pin, upgrades.first()) {
                let target = action.target_version().unwrap_or_default();
                if !version_satisfies_pin(target, pin) {
                    bail!(
                        "catalog offers {} v{target}, which does not satisfy --version {pin}",
                        action.name()
                    );
                }
            }

            if upgrades.is_empty() {
                renderer.print_status("ok", "installed packages are up to date");
                return Ok(());
            }
            renderer.print_section("Available updates");
            renderer.print_lines(&render_action_lines(&upgrades));
            if check {
                return Ok(());
            }
            workspace.apply(&catalog, &upgrades, false, renderer)?;
        }
        Commands::Remove { name } => {
            validate_package_name(&name)?;
            let version = match workspace.store.get(&name) {
                Some(record) => record.version.clone(),
                None if dir_is_populated(&workspace.layout.package_dir(&name)) => {
                    UNKNOWN_VERSION.to_string()
                }
                None => bail!("package '{name}' is not installed"),
            };
            let action = Action::Remove { name, version };
            workspace.apply(&Catalog::default(), &[action], false, renderer)?;
        }
        Commands::List => {
            let records = workspace.store.all().cloned().collect::<Vec<_>>();
            let catalog = if workspace.config.catalog_url.is_some() {
                match workspace.fetch_catalog() {
                    Ok(catalog) => Some(catalog),
                    Err(err) => {
                        renderer.print_status(
                            "warn",
                            &format!("catalog status unavailable: {err:#}"),
                        );
                        None
                    }
                }
            } else {
                None
            };
            renderer.print_lines(&render_list_lines(&records, catalog.as_ref()));
        }
        Commands::Env => {
            let names = workspace.store.names();
            let path = write_env_file(&workspace.layout, names.iter().map(String::as_str))
                .context("failed to regenerate environment file")?;
            println!("{}", path.display());
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn print_plan(renderer: TerminalRenderer, catalog: &Catalog, plan: &Reconciliation) {
    report_reconcile_notes(renderer, plan);
    renderer.print_section("SDK Manager");
    renderer.print_lines(&render_plan_lines(catalog, plan));
    if !plan.is_up_to_date() {
        renderer.print_section("Available actions");
        renderer.print_lines(&render_action_lines(&plan.actions));
    }
}

fn report_reconcile_notes(renderer: TerminalRenderer, plan: &Reconciliation) {
    for name in &plan.pruned {
        renderer.print_status(
            "warn",
            &format!("dropped record for {name}: its directory is missing or empty"),
        );
    }
    for warning in &plan.warnings {
        renderer.print_status("warn", warning);
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .context("failed to read confirmation")
}

fn install_interrupt_handler(cancel: &CancelToken) {
    let cancel = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        eprintln!("interrupt received; stopping after cleanup");
        cancel.cancel();
    }) {
        tracing::warn!(error = %err, "interrupt handler not installed");
    }
}

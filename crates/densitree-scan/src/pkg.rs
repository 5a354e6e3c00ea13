//! Installed-package reading.
//!
//! A [`PkgReader`] queries the system's package managers for installed
//! packages, puts a synthetic `Pkg:` root with one node per package into
//! the tree, and creates one blocked [`PkgJob`] per package. Each job
//! waits for an external file-list process (throttled by the queue's
//! process pool), then rebuilds the package's directory structure by
//! stat-ing every reported path.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use compact_str::CompactString;
use regex::Regex;
use tracing::{debug, error, info, warn};

use densitree_core::{
    wildcard_to_regex, Node, NodeId, PkgMeta, ReadState, ScanError, Settings, Tree,
};

use crate::job::{finish_reading, JobKind, JobOutcome};
use crate::local::stat_and_insert;
use crate::process::{ProcessOutcome, ProcessSpec};
use crate::queue::JobQueue;
use crate::sysutil::{have_command, run_command, try_run_command};

/// One installed package as reported by its manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgListEntry {
    pub base_name: CompactString,
    pub version: CompactString,
    pub arch: CompactString,
}

/// A package manager backend.
///
/// `is_primary` must probe harder than a binary-exists check: a system
/// can carry a foreign manager (rpm on Ubuntu) that manages a handful of
/// packages without managing itself.
pub trait PkgManager: fmt::Debug + Send + Sync {
    /// Name of this package manager.
    fn name(&self) -> &'static str;

    /// Check if this manager manages the running system.
    fn is_primary(&self) -> bool;

    /// Check if this manager's tools are present at all.
    fn is_available(&self) -> bool;

    /// The package owning `path`, if any. Synchronous entry point used
    /// outside the job queue.
    fn owning_pkg(&self, path: &Path) -> Option<String>;

    /// List the installed packages.
    fn list_installed(&self) -> Result<Vec<PkgListEntry>, ScanError>;

    /// The external command producing a package's file list.
    fn file_list_command(&self, pkg: &PkgInfo) -> String;

    /// Parse the file-list command's output into paths.
    fn parse_file_list(&self, output: &str) -> Vec<String>;
}

/// An installed package bound to its owning manager.
#[derive(Debug, Clone)]
pub struct PkgInfo {
    pub base_name: CompactString,
    pub version: CompactString,
    pub arch: CompactString,
    /// Name shown in the tree; disambiguated for multi-installs.
    pub display_name: CompactString,
    pub multi_version: bool,
    pub multi_arch: bool,
    pub manager: Arc<dyn PkgManager>,
}

impl PkgInfo {
    /// Wrap a list entry; the display name starts as the base name.
    pub fn new(entry: PkgListEntry, manager: Arc<dyn PkgManager>) -> Self {
        Self {
            display_name: entry.base_name.clone(),
            base_name: entry.base_name,
            version: entry.version,
            arch: entry.arch,
            multi_version: false,
            multi_arch: false,
            manager,
        }
    }

    fn meta(&self) -> PkgMeta {
        PkgMeta {
            base_name: self.base_name.clone(),
            version: self.version.clone(),
            arch: self.arch.clone(),
            multi_version: self.multi_version,
            multi_arch: self.multi_arch,
        }
    }
}

const DPKG: &str = "/usr/bin/dpkg";
const DPKG_QUERY: &str = "/usr/bin/dpkg-query";

/// Debian / Ubuntu package manager support.
#[derive(Debug, Default)]
pub struct DpkgManager;

impl DpkgManager {
    fn query_name(pkg: &PkgInfo) -> String {
        let mut name = pkg.base_name.to_string();
        if pkg.multi_version {
            name.push('_');
            name.push_str(&pkg.version);
        }
        if pkg.multi_arch {
            name.push(':');
            name.push_str(&pkg.arch);
        }
        name
    }

    fn parse_pkg_list(output: &str) -> Vec<PkgListEntry> {
        let mut list = Vec::new();
        for line in output.lines().filter(|l| !l.is_empty()) {
            let fields: Vec<&str> = line.split(" | ").collect();
            if fields.len() != 4 {
                error!("Invalid dpkg-query output: \"{line}\"");
                continue;
            }
            if fields[3] == "install ok installed" {
                list.push(PkgListEntry {
                    base_name: fields[0].into(),
                    version: fields[1].into(),
                    arch: fields[2].into(),
                });
            }
        }
        list
    }
}

impl PkgManager for DpkgManager {
    fn name(&self) -> &'static str {
        "dpkg"
    }

    fn is_primary(&self) -> bool {
        try_run_command(DPKG, &["-S", DPKG], "^dpkg:.*")
    }

    fn is_available(&self) -> bool {
        have_command(DPKG)
    }

    fn owning_pkg(&self, path: &Path) -> Option<String> {
        let (exit_code, output) =
            run_command(DPKG, &["-S", path.to_string_lossy().as_ref()]).ok()?;
        if exit_code != 0 || output.contains("no path found matching pattern") {
            return None;
        }
        Some(output.split(':').next().unwrap_or("").trim().to_string())
    }

    fn list_installed(&self) -> Result<Vec<PkgListEntry>, ScanError> {
        let (exit_code, output) = run_command(
            DPKG_QUERY,
            &[
                "--show",
                "--showformat=${Package} | ${Version} | ${Architecture} | ${Status}\n",
            ],
        )?;
        if exit_code != 0 {
            error!("dpkg-query --show exited with {exit_code}");
            return Ok(Vec::new());
        }
        Ok(Self::parse_pkg_list(&output))
    }

    fn file_list_command(&self, pkg: &PkgInfo) -> String {
        format!("{DPKG_QUERY} --listfiles {}", Self::query_name(pkg))
    }

    fn parse_file_list(&self, output: &str) -> Vec<String> {
        output
            .lines()
            .filter(|line| !line.is_empty() && *line != "/.")
            .map(str::to_string)
            .collect()
    }
}

/// RPM package manager support (SUSE, Red Hat, Fedora; also as a
/// secondary manager elsewhere).
#[derive(Debug)]
pub struct RpmManager {
    rpm_command: &'static str,
}

impl RpmManager {
    pub fn new() -> Self {
        // A /bin/rpm -> /usr/bin/rpm symlink cannot be relied on in
        // either direction; probe both, preferring the modern path.
        let rpm_command = if have_command("/usr/bin/rpm") {
            "/usr/bin/rpm"
        } else {
            "/bin/rpm"
        };
        Self { rpm_command }
    }

    fn query_name(pkg: &PkgInfo) -> String {
        let mut name = pkg.base_name.to_string();
        if !pkg.version.is_empty() {
            name.push('-');
            name.push_str(&pkg.version);
        }
        if !pkg.arch.is_empty() {
            name.push('.');
            name.push_str(&pkg.arch);
        }
        name
    }

    fn parse_pkg_list(output: &str) -> Vec<PkgListEntry> {
        let mut list = Vec::new();
        for line in output.lines().filter(|l| !l.is_empty()) {
            let fields: Vec<&str> = line.split(" | ").collect();
            if fields.len() != 3 {
                error!("Invalid rpm -qa output: \"{line}\"");
                continue;
            }
            let arch = if fields[2] == "(none)" { "" } else { fields[2] };
            list.push(PkgListEntry {
                base_name: fields[0].into(),
                version: fields[1].into(),
                arch: arch.into(),
            });
        }
        list
    }
}

impl Default for RpmManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PkgManager for RpmManager {
    fn name(&self) -> &'static str {
        "rpm"
    }

    fn is_primary(&self) -> bool {
        try_run_command(self.rpm_command, &["-qf", self.rpm_command], "^rpm.*")
    }

    fn is_available(&self) -> bool {
        have_command(self.rpm_command)
    }

    fn owning_pkg(&self, path: &Path) -> Option<String> {
        let (exit_code, output) = run_command(
            self.rpm_command,
            &["-qf", "--queryformat", "%{name}", path.to_string_lossy().as_ref()],
        )
        .ok()?;
        if exit_code != 0 || output.contains("not owned by any package") {
            return None;
        }
        Some(output.trim().to_string())
    }

    fn list_installed(&self) -> Result<Vec<PkgListEntry>, ScanError> {
        let (exit_code, output) = run_command(
            self.rpm_command,
            &["-qa", "--queryformat", "%{name} | %{version}-%{release} | %{arch}\n"],
        )?;
        if exit_code != 0 {
            error!("rpm -qa exited with {exit_code}");
            return Ok(Vec::new());
        }
        Ok(Self::parse_pkg_list(&output))
    }

    fn file_list_command(&self, pkg: &PkgInfo) -> String {
        format!("{} -ql {}", self.rpm_command, Self::query_name(pkg))
    }

    fn parse_file_list(&self, output: &str) -> Vec<String> {
        output
            .lines()
            .filter(|line| !line.is_empty() && *line != "(contains no files)")
            .map(str::to_string)
            .collect()
    }
}

/// Queries across all package managers present on the system.
pub struct PkgQuery;

impl PkgQuery {
    /// All installed packages from every available manager.
    pub fn installed() -> Vec<PkgInfo> {
        let managers: Vec<Arc<dyn PkgManager>> =
            vec![Arc::new(DpkgManager), Arc::new(RpmManager::new())];

        let mut pkgs = Vec::new();
        for manager in managers {
            if !manager.is_available() {
                continue;
            }
            match manager.list_installed() {
                Ok(entries) => {
                    info!("{}: {} installed packages", manager.name(), entries.len());
                    pkgs.extend(
                        entries
                            .into_iter()
                            .map(|entry| PkgInfo::new(entry, manager.clone())),
                    );
                }
                Err(e) => warn!("{}: {e}", manager.name()),
            }
        }
        pkgs
    }
}

/// Selects which packages to read.
#[derive(Debug, Clone)]
pub enum PkgFilter {
    /// Every installed package.
    SelectAll,
    /// Base name contains the string.
    Substring(String),
    /// Base name matches the wildcard pattern.
    Wildcard(Regex),
    /// Base name matches the regular expression.
    Regex(Regex),
}

impl PkgFilter {
    /// Guess the filter kind from a pattern: empty selects everything,
    /// `*`/`?` makes it a wildcard, anything else a substring.
    pub fn parse(pattern: &str) -> Result<Self, ScanError> {
        if pattern.is_empty() {
            Ok(Self::SelectAll)
        } else if pattern.contains(['*', '?']) {
            Self::wildcard(pattern)
        } else {
            Ok(Self::Substring(pattern.to_string()))
        }
    }

    /// A wildcard filter.
    pub fn wildcard(pattern: &str) -> Result<Self, ScanError> {
        let regex = Regex::new(&wildcard_to_regex(pattern)).map_err(|e| ScanError::Config {
            message: format!("Bad package filter \"{pattern}\": {e}"),
        })?;
        Ok(Self::Wildcard(regex))
    }

    /// A regular-expression filter.
    pub fn regex(pattern: &str) -> Result<Self, ScanError> {
        let regex = Regex::new(pattern).map_err(|e| ScanError::Config {
            message: format!("Bad package filter \"{pattern}\": {e}"),
        })?;
        Ok(Self::Regex(regex))
    }

    /// Check if everything is selected.
    pub fn is_select_all(&self) -> bool {
        matches!(self, Self::SelectAll)
    }

    /// Match a package base name.
    pub fn matches(&self, base_name: &str) -> bool {
        match self {
            Self::SelectAll => true,
            Self::Substring(s) => base_name.contains(s.as_str()),
            Self::Wildcard(re) | Self::Regex(re) => re.is_match(base_name),
        }
    }
}

/// One-shot driver: queries, filters, disambiguates, and creates one
/// blocked read job per package. Not itself a job; once the jobs are
/// queued the reader is no longer needed.
pub struct PkgReader {
    max_parallel_processes: usize,
}

impl PkgReader {
    /// Create a reader with the cap from the persisted settings.
    pub fn new(settings: &Settings) -> Self {
        Self {
            max_parallel_processes: settings.pkg.max_parallel_processes,
        }
    }

    /// Read all packages matching `filter` from the system's managers.
    pub fn read(&self, tree: &mut Tree, queue: &mut JobQueue, filter: &PkgFilter) {
        self.read_pkg_list(tree, queue, filter, PkgQuery::installed());
    }

    /// Like [`read`](Self::read) with an explicit package list.
    pub fn read_pkg_list(
        &self,
        tree: &mut Tree,
        queue: &mut JobQueue,
        filter: &PkgFilter,
        mut pkg_list: Vec<PkgInfo>,
    ) {
        if !filter.is_select_all() {
            pkg_list.retain(|pkg| filter.matches(&pkg.base_name));
        }
        handle_multi_pkg(&mut pkg_list);

        let nodes = add_pkg_to_tree(tree, &pkg_list);
        self.create_read_jobs(tree, queue, pkg_list, nodes);
    }

    fn create_read_jobs(
        &self,
        tree: &mut Tree,
        queue: &mut JobQueue,
        pkg_list: Vec<PkgInfo>,
        nodes: Vec<NodeId>,
    ) {
        queue
            .process_pool_mut()
            .set_max_parallel(self.max_parallel_processes);

        for (pkg, node) in pkg_list.into_iter().zip(nodes) {
            let command = pkg.manager.file_list_command(&pkg);
            let Some(spec) = ProcessSpec::from_command(&command) else {
                error!("Empty file list command for {}", pkg.display_name);
                finish_reading(tree, node, ReadState::Error);
                continue;
            };

            let job = PkgJob::new(tree, node, pkg);
            queue.block_with_process(JobKind::Pkg(job), spec);
        }

        queue.start_processes();
    }
}

/// Packages installed in several versions or architectures get the
/// version or architecture appended so the user can tell them apart.
fn handle_multi_pkg(pkg_list: &mut [PkgInfo]) {
    let mut groups: BTreeMap<CompactString, Vec<usize>> = BTreeMap::new();
    for (index, pkg) in pkg_list.iter().enumerate() {
        groups.entry(pkg.base_name.clone()).or_default().push(index);
    }

    for (base_name, indices) in groups {
        if indices.len() < 2 {
            continue;
        }

        let first = &pkg_list[indices[0]];
        let same_version = indices.iter().all(|&i| pkg_list[i].version == first.version);
        let same_arch = indices.iter().all(|&i| pkg_list[i].arch == first.arch);

        if !same_version {
            debug!("Found multi version pkg {base_name} same arch: {same_arch}");
        }

        for &index in &indices {
            let pkg = &mut pkg_list[index];
            let mut display = pkg.base_name.to_string();
            if !same_version {
                display.push('-');
                display.push_str(&pkg.version);
                pkg.multi_version = true;
            }
            if !same_arch {
                display.push(':');
                display.push_str(&pkg.arch);
                pkg.multi_arch = true;
            }
            pkg.display_name = display.into();
        }
    }
}

/// Put the `Pkg:` root and one node per package into the tree.
fn add_pkg_to_tree(tree: &mut Tree, pkg_list: &[PkgInfo]) -> Vec<NodeId> {
    let top = tree.insert_child(tree.root(), Node::dir("Pkg:"));

    let nodes = pkg_list
        .iter()
        .map(|pkg| tree.insert_child(top, Node::pkg(pkg.display_name.clone(), pkg.meta())))
        .collect();

    tree.send_finalize_local(top);
    tree.set_read_state(top, ReadState::Finished);
    nodes
}

/// Two-phase package read job.
///
/// Phase A: blocked until the file-list process exits. Phase B: runnable;
/// one tick rebuilds the package's directory structure from the list.
#[derive(Debug)]
pub(crate) struct PkgJob {
    dir: NodeId,
    pkg: PkgInfo,
    file_list: Vec<String>,
}

impl PkgJob {
    pub(crate) fn new(tree: &mut Tree, pkg_node: NodeId, pkg: PkgInfo) -> Self {
        tree.read_job_added(pkg_node);
        Self {
            dir: pkg_node,
            pkg,
            file_list: Vec::new(),
        }
    }

    pub(crate) fn dir(&self) -> NodeId {
        self.dir
    }

    /// Phase A: the file-list process completed. Returns whether the job
    /// is ready to be unblocked; on failure the package is already
    /// marked and announced, and the job just needs disposing.
    pub(crate) fn on_process_exit(&mut self, tree: &mut Tree, outcome: &ProcessOutcome) -> bool {
        match outcome {
            ProcessOutcome::Exited { code: 0, output } => {
                self.file_list = self.pkg.manager.parse_file_list(output);
                true
            }
            ProcessOutcome::Exited { code, .. } => {
                error!(
                    "File list command exited with {code} for {}",
                    self.pkg.display_name
                );
                self.fail(tree);
                false
            }
            ProcessOutcome::Failed { message } => {
                error!("File list command for {}: {message}", self.pkg.display_name);
                self.fail(tree);
                false
            }
        }
    }

    fn fail(&self, tree: &mut Tree) {
        tree.set_read_state(self.dir, ReadState::Error);
        tree.send_read_job_finished(self.dir);
    }

    /// Phase B: drain the parsed file list into the tree.
    pub(crate) fn run(&mut self, tree: &mut Tree) -> JobOutcome {
        tree.set_read_state(self.dir, ReadState::Reading);

        let file_list = std::mem::take(&mut self.file_list);
        for path in file_list.iter().filter(|p| !p.is_empty()) {
            self.add_file(tree, path);
        }

        self.finalize_all(tree, self.dir);
        tree.send_read_job_finished(self.dir);
        JobOutcome::Finished
    }

    /// Walk the path below the package node, synthesizing every missing
    /// component by stat-ing the corresponding system path.
    fn add_file(&self, tree: &mut Tree, file_list_path: &str) {
        let components: Vec<&str> = file_list_path.split('/').filter(|c| !c.is_empty()).collect();
        let mut parent = self.dir;
        let mut system_path = String::new();

        for (depth, component) in components.iter().enumerate() {
            system_path.push('/');
            system_path.push_str(component);

            let node = match tree.find_child(parent, component) {
                Some(existing) => existing,
                None => match stat_and_insert(tree, parent, Path::new(&system_path)) {
                    Ok(created) => created,
                    Err(e) => {
                        info!("{e}");
                        tree.set_read_state(parent, ReadState::Error);
                        return;
                    }
                },
            };

            if depth + 1 < components.len() {
                if !tree.node(node).is_some_and(|n| n.is_dir()) {
                    warn!("{system_path} should be a directory, but is not");
                    return;
                }
                parent = node;
            }
        }
    }

    /// Depth-first settle of the package subtree.
    fn finalize_all(&self, tree: &mut Tree, subtree: NodeId) {
        let children: Vec<NodeId> = tree.children(subtree).to_vec();
        for child in children {
            if tree.node(child).is_some_and(|n| n.is_dir()) {
                self.finalize_all(tree, child);
            }
        }

        tree.send_finalize_local(subtree);
        if tree.read_state(subtree) != Some(ReadState::Error) {
            tree.set_read_state(subtree, ReadState::Finished);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, version: &str, arch: &str) -> PkgListEntry {
        PkgListEntry {
            base_name: name.into(),
            version: version.into(),
            arch: arch.into(),
        }
    }

    fn pkg(name: &str, version: &str, arch: &str) -> PkgInfo {
        PkgInfo::new(entry(name, version, arch), Arc::new(DpkgManager))
    }

    #[test]
    fn test_dpkg_parse_pkg_list() {
        let output = "\
bash | 5.2.21 | amd64 | install ok installed
removed-pkg | 1.0 | amd64 | deinstall ok config-files
broken line
zsh | 5.9 | amd64 | install ok installed
";
        let list = DpkgManager::parse_pkg_list(output);
        assert_eq!(
            list,
            vec![
                entry("bash", "5.2.21", "amd64"),
                entry("zsh", "5.9", "amd64"),
            ]
        );
    }

    #[test]
    fn test_rpm_parse_pkg_list() {
        let output = "\
bash | 5.2.15-3.fc39 | x86_64
gpg-pubkey | 18b8e74c-62f2920f | (none)
";
        let list = RpmManager::parse_pkg_list(output);
        assert_eq!(
            list,
            vec![
                entry("bash", "5.2.15-3.fc39", "x86_64"),
                entry("gpg-pubkey", "18b8e74c-62f2920f", ""),
            ]
        );
    }

    #[test]
    fn test_dpkg_query_name() {
        let mut info = pkg("foo", "1.0", "amd64");
        assert_eq!(DpkgManager::query_name(&info), "foo");

        info.multi_version = true;
        assert_eq!(DpkgManager::query_name(&info), "foo_1.0");

        info.multi_arch = true;
        assert_eq!(DpkgManager::query_name(&info), "foo_1.0:amd64");
    }

    #[test]
    fn test_rpm_query_name() {
        let info = pkg("foo", "1.0-3", "x86_64");
        assert_eq!(RpmManager::query_name(&info), "foo-1.0-3.x86_64");

        let bare = pkg("foo", "", "");
        assert_eq!(RpmManager::query_name(&bare), "foo");
    }

    #[test]
    fn test_dpkg_file_list_parser_drops_cruft() {
        let output = "/.\n/usr\n/usr/bin\n/usr/bin/x\n\n";
        assert_eq!(
            DpkgManager.parse_file_list(output),
            vec!["/usr", "/usr/bin", "/usr/bin/x"]
        );
    }

    #[test]
    fn test_rpm_file_list_parser_drops_placeholder() {
        assert!(RpmManager::new()
            .parse_file_list("(contains no files)\n")
            .is_empty());
    }

    #[test]
    fn test_handle_multi_pkg_display_names() {
        let mut list = vec![
            pkg("foo", "1.0", "amd64"),
            pkg("foo", "2.0", "amd64"),
            pkg("bar", "1.0", "amd64"),
        ];
        handle_multi_pkg(&mut list);

        let names: Vec<&str> = list.iter().map(|p| p.display_name.as_str()).collect();
        assert_eq!(names, vec!["foo-1.0", "foo-2.0", "bar"]);
        assert!(list[0].multi_version && !list[0].multi_arch);
        assert!(!list[2].multi_version);
    }

    #[test]
    fn test_handle_multi_arch_display_names() {
        let mut list = vec![pkg("libc", "2.38", "amd64"), pkg("libc", "2.38", "i386")];
        handle_multi_pkg(&mut list);

        let names: Vec<&str> = list.iter().map(|p| p.display_name.as_str()).collect();
        assert_eq!(names, vec!["libc:amd64", "libc:i386"]);
        assert!(list.iter().all(|p| p.multi_arch && !p.multi_version));
    }

    #[test]
    fn test_pkg_filter() {
        assert!(PkgFilter::SelectAll.matches("anything"));

        let sub = PkgFilter::parse("lib").unwrap();
        assert!(sub.matches("libc6"));
        assert!(!sub.matches("bash"));

        let wild = PkgFilter::parse("lib*6").unwrap();
        assert!(matches!(wild, PkgFilter::Wildcard(_)));
        assert!(wild.matches("libc6"));
        assert!(!wild.matches("libc"));

        let re = PkgFilter::regex("^ba(sh|t)$").unwrap();
        assert!(re.matches("bash"));
        assert!(!re.matches("bashful"));

        assert!(PkgFilter::regex("(").is_err());
        assert!(PkgFilter::parse("").unwrap().is_select_all());
    }
}

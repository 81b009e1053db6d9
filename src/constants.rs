// -
// Identity

/// Owner id of items that no node holds; their contents live in the backing store.
pub const SERVER: crate::NodeId = 0;

// -
// Database namespaces

/// Sled database tree namespaces
pub(crate) const OWNER_TREE: &str = "_grid_owners";
pub(crate) const ITEM_TREE: &str = "_grid_items";
pub(crate) const ALLOCATION_TREE: &str = "_grid_allocations";
pub(crate) const META_TREE: &str = "_grid_meta";

/// Sled entry key namespaces
pub(crate) const META_KEY_ALLOCATION_HIGH_WATER: &str = "_allocation_high_water";

// -
// Distributed tree paths

/// Parent of one child per node group; each group has one ephemeral child per member.
pub(crate) const TREE_NODES_ROOT: &str = "/grid/nodes";

/// Node properties live at `{root}/{node}/{key}`.
pub(crate) const TREE_PROPERTIES_ROOT: &str = "/grid/properties";

// -
// Service names

pub(crate) const SERVICE_STORAGE: &str = "storage";
pub(crate) const SERVICE_DIRECTORY: &str = "directory";
pub(crate) const SERVICE_CLUSTER: &str = "cluster";
pub(crate) const SERVICE_BACKUP: &str = "backup";
pub(crate) const SERVICE_CACHE: &str = "cache";
pub(crate) const SERVICE_MESSENGER: &str = "messenger";

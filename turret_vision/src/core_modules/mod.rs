pub mod actuator;
pub mod angle_mapper;
pub mod blob_detector;
pub mod debouncer;
pub mod frame;
pub mod localizer;
pub mod motion_localizer;
pub mod net_localizer;
pub mod region;
pub mod turret;
pub mod utils;

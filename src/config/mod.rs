pub mod settings;

pub use settings::{
    generate_default_config, LabOptions, LabRequest, LabSettings, LabType, MetadataInput, SettingsSources,
};

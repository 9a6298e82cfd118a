pub mod adapters {
    pub mod credentials;
    pub mod input;
    pub mod openai;
    pub mod provider;
}

pub mod cli {
    pub mod interface;
}

pub mod core {
    pub mod error;
    pub mod job;
    pub mod orchestrator;
    pub mod submitter;
    pub mod uploader;
}

pub mod utils {
    pub mod lib;
}

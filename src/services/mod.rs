pub mod assets;
pub mod batch;
pub mod consistency;
pub mod drafts;
pub mod generation;
pub mod image;
pub mod llm;
pub mod phases;
pub mod prompts;
pub mod workflow;

#[cfg(test)]
pub mod testing;

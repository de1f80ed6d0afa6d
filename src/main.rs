fn main() {
    spike_pipeline::cli::run();
}

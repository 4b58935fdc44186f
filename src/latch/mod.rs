mod nb_mutex;

pub use nb_mutex::NbMutex;
